//! Error types for the guest control channel.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use guestlink::{GuestLink, Result};
//!
//! fn example(link: &GuestLink) -> Result<()> {
//!     let window = link.open("fileManagement", &[])?;
//!     window.invoke("recycle", &["C:\\Users\\alice\\Desktop\\notes.txt"])?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::InvalidFrameHeader`], [`Error::FrameTooLarge`], [`Error::UnknownVerb`], [`Error::MalformedCommand`], [`Error::InvalidArgument`] |
//! | Dispatch | [`Error::UnknownModule`], [`Error::MethodNotFound`], [`Error::WindowNotFound`], [`Error::DuplicateModule`], [`Error::GuestNotFound`], [`Error::Handler`] |
//! | Execution | [`Error::Timeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Base64`], [`Error::Zip`], [`Error::WalkDir`] |
//!
//! Transport and protocol errors raised inside a receive loop never reach
//! caller code: they are logged and turned into a link state change. Dispatch
//! and timeout errors on the guest are reported to the host as an `error`
//! window event.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use base64::DecodeError;
use thiserror::Error;
use zip::result::ZipError;

use crate::identifiers::WindowId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a link, agent or listener configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket level failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out waiting for a guest to connect or register.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The link has no live connection.
    ///
    /// Returned when sending on a disconnected link.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Frame length header is not eight hexadecimal digits.
    #[error("Invalid frame header: {header:?}")]
    InvalidFrameHeader {
        /// The offending header bytes, lossily decoded.
        header: String,
    },

    /// Frame exceeds the configured or encodable maximum length.
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared or actual payload length.
        len: u64,
        /// Maximum accepted payload length.
        max: u64,
    },

    /// Payload verb is not part of the protocol.
    #[error("Unknown verb: {verb}")]
    UnknownVerb {
        /// The unrecognized verb.
        verb: String,
    },

    /// Payload does not match the grammar of its verb.
    #[error("Malformed {verb} command: {message}")]
    MalformedCommand {
        /// Verb of the malformed command.
        verb: String,
        /// Description of what was wrong.
        message: String,
    },

    /// Invalid argument supplied to a command or handler.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No module registered under this name.
    #[error("Unknown module: {module}")]
    UnknownModule {
        /// The requested module name.
        module: String,
    },

    /// Module has no method with this name.
    #[error("Method not found: {module}.{method}")]
    MethodNotFound {
        /// Module name.
        module: String,
        /// The requested method name.
        method: String,
    },

    /// No window with this id is registered for the module.
    #[error("Window not found: {module} #{window_id}")]
    WindowNotFound {
        /// Module name.
        module: String,
        /// The missing window id.
        window_id: WindowId,
    },

    /// Module name registered twice.
    #[error("Module already registered: {module}")]
    DuplicateModule {
        /// The duplicated module name.
        module: String,
    },

    /// Registration handshake named a MAC address no link owns.
    #[error("No guest registered for MAC address {mac}")]
    GuestNotFound {
        /// MAC address from the handshake.
        mac: String,
    },

    /// Application handler reported a failure.
    #[error("Handler error: {message}")]
    Handler {
        /// Error message from the handler.
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Operation timeout.
    ///
    /// Returned when operation exceeds timeout duration.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 field could not be decoded.
    #[error("Base64 error: {0}")]
    Base64(#[from] DecodeError),

    /// Directory archive could not be written or read.
    #[error("Archive error: {0}")]
    Zip(#[from] ZipError),

    /// Directory walk failed while building an archive.
    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an invalid frame header error.
    #[inline]
    pub fn invalid_frame_header(header: &[u8]) -> Self {
        Self::InvalidFrameHeader {
            header: String::from_utf8_lossy(header).into_owned(),
        }
    }

    /// Creates a frame too large error.
    #[inline]
    pub fn frame_too_large(len: u64, max: u64) -> Self {
        Self::FrameTooLarge { len, max }
    }

    /// Creates an unknown verb error.
    #[inline]
    pub fn unknown_verb(verb: impl Into<String>) -> Self {
        Self::UnknownVerb { verb: verb.into() }
    }

    /// Creates a malformed command error.
    #[inline]
    pub fn malformed(verb: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedCommand {
            verb: verb.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an unknown module error.
    #[inline]
    pub fn unknown_module(module: impl Into<String>) -> Self {
        Self::UnknownModule {
            module: module.into(),
        }
    }

    /// Creates a method not found error.
    #[inline]
    pub fn method_not_found(module: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            module: module.into(),
            method: method.into(),
        }
    }

    /// Creates a window not found error.
    #[inline]
    pub fn window_not_found(module: impl Into<String>, window_id: WindowId) -> Self {
        Self::WindowNotFound {
            module: module.into(),
            window_id,
        }
    }

    /// Creates a duplicate module error.
    #[inline]
    pub fn duplicate_module(module: impl Into<String>) -> Self {
        Self::DuplicateModule {
            module: module.into(),
        }
    }

    /// Creates a guest not found error.
    #[inline]
    pub fn guest_not_found(mac: impl Into<String>) -> Self {
        Self::GuestNotFound { mac: mac.into() }
    }

    /// Creates a handler error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. } | Self::ConnectionClosed
        )
    }

    /// Returns `true` if this is a wire protocol error.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrameHeader { .. }
                | Self::FrameTooLarge { .. }
                | Self::UnknownVerb { .. }
                | Self::MalformedCommand { .. }
                | Self::InvalidArgument { .. }
                | Self::Base64(_)
        )
    }

    /// Returns `true` if this is a dispatch error.
    #[inline]
    #[must_use]
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownModule { .. }
                | Self::MethodNotFound { .. }
                | Self::WindowNotFound { .. }
                | Self::DuplicateModule { .. }
                | Self::GuestNotFound { .. }
                | Self::Handler { .. }
        )
    }

    /// Returns `true` if a receive loop hitting this error must drop the connection.
    ///
    /// A corrupt length header leaves the byte stream unsynchronised; other
    /// protocol errors only cost the offending frame.
    #[inline]
    #[must_use]
    pub fn is_fatal_to_stream(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrameHeader { .. } | Self::FrameTooLarge { .. }
        ) || self.is_transport_error()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("reset by peer");
        assert_eq!(err.to_string(), "Connection failed: reset by peer");
    }

    #[test]
    fn test_method_not_found_display() {
        let err = Error::method_not_found("fileManagement", "shred");
        assert_eq!(err.to_string(), "Method not found: fileManagement.shred");
    }

    #[test]
    fn test_window_not_found_display() {
        let err = Error::window_not_found("mailClient", WindowId::new(4));
        assert_eq!(err.to_string(), "Window not found: mailClient #4");
    }

    #[test]
    fn test_invalid_frame_header_lossy() {
        let err = Error::invalid_frame_header(b"0000zz\xff1");
        assert!(err.is_protocol_error());
        assert!(err.is_fatal_to_stream());
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timeout("fileManagement.recycle", 50);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_categories_are_disjoint() {
        let transport = Error::ConnectionClosed;
        let protocol = Error::unknown_verb("frobnicate");
        let dispatch = Error::unknown_module("calculator");

        assert!(transport.is_transport_error());
        assert!(!transport.is_protocol_error());
        assert!(protocol.is_protocol_error());
        assert!(!protocol.is_dispatch_error());
        assert!(dispatch.is_dispatch_error());
        assert!(!dispatch.is_transport_error());
    }

    #[test]
    fn test_unknown_verb_not_fatal() {
        assert!(!Error::unknown_verb("frobnicate").is_fatal_to_stream());
        assert!(!Error::malformed("shellExecComplete", "missing exit code").is_fatal_to_stream());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
