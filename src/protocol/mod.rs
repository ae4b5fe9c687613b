//! Control channel wire protocol.
//!
//! This module defines how bytes on the socket become typed commands and
//! events, in both directions.
//!
//! # Protocol Overview
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Framing | [`FrameDecoder`], [`frame::encode`] | 8 hex digit length prefix + payload |
//! | Fields | [`CommandArgs`], [`args::encode_field`] | base64 argument fields |
//! | Host → Guest | [`GuestCommand`] | commands executed by the guest agent |
//! | Guest → Host | [`HostEvent`] | events updating host bookkeeping |
//!
//! # Payload Shape
//!
//! Every payload is `<verb> <args…>`:
//!
//! - `application fileManagement 7 recycle QzpcdGVtcA==`
//! - `shellExecComplete 4 0 aGVsbG8K `
//! - `application fileManagement 7 error`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Length-prefixed framing |
//! | `args` | Base64 field helpers and decoded argument lists |
//! | `command` | Verbs, payload builder and guest-bound commands |
//! | `event` | Host-bound events and window state vocabulary |

// ============================================================================
// Submodules
// ============================================================================

/// Base64 argument fields.
pub mod args;

/// Verbs and guest-bound commands.
pub mod command;

/// Host-bound events.
pub mod event;

/// Length-prefixed framing.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use args::CommandArgs;
pub use command::{
    ApplicationCall, CommandBuilder, FileCommand, GuestCommand, RemoteShellExecCommand,
    ShellExecCommand, Verb,
};
pub use event::{HostEvent, NetworkInfo, WindowEvent};
pub use frame::FrameDecoder;
