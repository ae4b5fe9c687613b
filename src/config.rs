//! Link, agent and listener configuration.
//!
//! Plain data with defaults, fluent `with_*` setters and serde support so
//! orchestration code can keep them in JSON next to its VM definitions.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use guestlink::AgentConfig;
//!
//! let config = AgentConfig::new()
//!     .with_default_method_timeout(Duration::from_secs(50))
//!     .with_shell_exec_timeout(Duration::from_secs(600));
//! config.validate()?;
//! ```
//!
//! | Setting | Default |
//! |---------|---------|
//! | `LinkConfig::max_frame_len` | `u32::MAX` |
//! | `LinkConfig::read_chunk_size` | 64 KiB |
//! | `LinkConfig::shell_poll_interval` | 1 s |
//! | `AgentConfig::default_method_timeout` | 1800 s |
//! | `AgentConfig::shell_exec_timeout` | 3600 s |
//! | `ListenerConfig::bind_addr` | `0.0.0.0:11000` |
//! | `ListenerConfig::max_handshake_len` | 16 KiB |

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::frame::MAX_PAYLOAD_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Port the host listens on for guest agents.
pub const DEFAULT_CONTROLLER_PORT: u16 = 11000;

/// Bound for application methods without an explicit timeout.
const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(1800);

/// Bound for a single guest-side ShellExec.
const DEFAULT_SHELL_EXEC_TIMEOUT: Duration = Duration::from_secs(3600);

/// Bound for file operations and maintenance commands.
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Cap on the `register` frame of a not yet identified guest.
const DEFAULT_MAX_HANDSHAKE_LEN: u32 = 16 * 1024;

/// Bytes requested per socket read.
const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// LinkConfig
// ============================================================================

/// Settings of one connection endpoint, host or guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Largest payload accepted from the peer.
    pub max_frame_len: u32,

    /// Bytes requested per socket read.
    pub read_chunk_size: usize,

    /// Polling interval of [`ShellExecRequest::wait`](crate::ShellExecRequest::wait).
    pub shell_poll_interval: Duration,

    /// Polling interval of [`GuestLink::wait_until_connected`](crate::GuestLink::wait_until_connected).
    pub connect_poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_PAYLOAD_LEN,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            shell_poll_interval: Duration::from_secs(1),
            connect_poll_interval: Duration::from_millis(100),
        }
    }
}

impl LinkConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the largest accepted payload.
    #[inline]
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Sets the socket read size.
    #[inline]
    #[must_use]
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Sets the ShellExec polling interval.
    #[inline]
    #[must_use]
    pub fn with_shell_poll_interval(mut self, interval: Duration) -> Self {
        self.shell_poll_interval = interval;
        self
    }

    /// Sets the connect polling interval.
    #[inline]
    #[must_use]
    pub fn with_connect_poll_interval(mut self, interval: Duration) -> Self {
        self.connect_poll_interval = interval;
        self
    }

    /// Checks the configuration for values that would stall a link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero read size or polling interval.
    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(Error::config("read_chunk_size must be greater than zero"));
        }
        if self.shell_poll_interval.is_zero() || self.connect_poll_interval.is_zero() {
            return Err(Error::config("polling intervals must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Settings of the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Connection settings.
    pub link: LinkConfig,

    /// Bound for methods registered without their own timeout.
    pub default_method_timeout: Duration,

    /// Bound for one `shellExec` or `remoteShellExec`.
    pub shell_exec_timeout: Duration,

    /// Bound for one `file` operation.
    pub file_op_timeout: Duration,

    /// Bound for `setOSTime`, `runElevated`, `cleanUp` and `initClean`.
    pub system_timeout: Duration,

    /// Initial working directory; the process working directory if unset.
    pub working_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            default_method_timeout: DEFAULT_METHOD_TIMEOUT,
            shell_exec_timeout: DEFAULT_SHELL_EXEC_TIMEOUT,
            file_op_timeout: DEFAULT_OPERATION_TIMEOUT,
            system_timeout: DEFAULT_OPERATION_TIMEOUT,
            working_dir: None,
        }
    }
}

impl AgentConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed input or [`Error::Config`] if
    /// the result fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the connection settings.
    #[inline]
    #[must_use]
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Sets the bound for methods without their own timeout.
    #[inline]
    #[must_use]
    pub fn with_default_method_timeout(mut self, timeout: Duration) -> Self {
        self.default_method_timeout = timeout;
        self
    }

    /// Sets the ShellExec bound.
    #[inline]
    #[must_use]
    pub fn with_shell_exec_timeout(mut self, timeout: Duration) -> Self {
        self.shell_exec_timeout = timeout;
        self
    }

    /// Sets the file operation bound.
    #[inline]
    #[must_use]
    pub fn with_file_op_timeout(mut self, timeout: Duration) -> Self {
        self.file_op_timeout = timeout;
        self
    }

    /// Sets the maintenance command bound.
    #[inline]
    #[must_use]
    pub fn with_system_timeout(mut self, timeout: Duration) -> Self {
        self.system_timeout = timeout;
        self
    }

    /// Sets the initial working directory.
    #[inline]
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero timeouts or an invalid link section.
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        let timeouts = [
            ("default_method_timeout", self.default_method_timeout),
            ("shell_exec_timeout", self.shell_exec_timeout),
            ("file_op_timeout", self.file_op_timeout),
            ("system_timeout", self.system_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, timeout)| timeout.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}

// ============================================================================
// ListenerConfig
// ============================================================================

/// Settings of the host-side listener guests connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind.
    pub bind_addr: SocketAddr,

    /// Time a new connection has to send its `register` frame.
    pub handshake_timeout: Duration,

    /// Largest frame accepted before the guest is identified.
    pub max_handshake_len: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CONTROLLER_PORT),
            handshake_timeout: Duration::from_secs(30),
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
        }
    }
}

impl ListenerConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the largest `register` frame accepted.
    #[inline]
    #[must_use]
    pub fn with_max_handshake_len(mut self, len: u32) -> Self {
        self.max_handshake_len = len;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
