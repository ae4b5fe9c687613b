//! Guestlink - host/guest control channel for automation inside VMs.
//!
//! A host process drives application automation inside guest virtual
//! machines over one TCP stream per guest. The guest runs an [`Agent`] that
//! opens application windows, runs shell commands, moves files and reports
//! its clock; the host keeps a [`GuestLink`] per guest that tracks windows
//! and ShellExec requests from the events the agent sends back.
//!
//! # Architecture
//!
//! - **Host**: [`GuestListener`] accepts guests, matches the `register`
//!   handshake to a [`GuestLink`] by MAC, and hands it the socket
//! - **Guest**: [`Agent`] dials the host and executes commands
//! - **Plugins**: both sides share one [`PluginRegistry`] mapping module names
//!   to a host handler factory and a guest method table
//!
//! Every frame is an 8 hex digit payload length followed by the payload.
//! Sending never blocks; results come back as events that update host state,
//! which callers observe by polling.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use guestlink::{GuestLink, GuestListener, ListenerConfig, PluginRegistry, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let link = GuestLink::builder("win10-analysis")
//!         .mac("52:54:00:12:34:56")
//!         .registry(Arc::new(PluginRegistry::new()))
//!         .build()?;
//!
//!     let listener = GuestListener::bind(ListenerConfig::default()).await?;
//!     listener.register_guest(link.clone())?;
//!     link.wait_until_connected(Duration::from_secs(300)).await?;
//!
//!     let request = link.shell_exec("whoami", None, None)?;
//!     let outcome = request.wait(Duration::from_secs(1)).await;
//!     println!("{}", outcome.stdout_lossy());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Guest agent: dispatcher, ShellExec runner, file operations |
//! | [`application`] | Plugin contracts and the module registry |
//! | [`config`] | Link, agent and listener settings |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Window and ShellExec ids |
//! | [`link`] | Host-side view of one guest |
//! | [`protocol`] | Framing, fields, commands and events |
//! | [`transport`] | Connection event loop and the guest listener |

// ============================================================================
// Modules
// ============================================================================

/// Guest agent.
///
/// Runs inside the VM and executes what the host sends.
pub mod agent;

/// Application plugins.
///
/// Host handler factories, guest method tables and the registry joining
/// them by module name.
pub mod application;

/// Configuration structs with defaults and JSON loading.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Host-side guest handle: windows, ShellExecs, transfers, metadata.
pub mod link;

/// Wire protocol.
pub mod protocol;

/// Byte stream transport.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Agent types
pub use agent::{
    Agent, AgentBuilder, Clock, Dispatcher, LocalClock, ProcessTerminator, SystemOps,
    SystemTerminator, UnsupportedSystemOps, WorkingDir,
};

// Application types
pub use application::{
    CancelFlag, GuestFactory, HostApplication, HostFactory, Invocation, MethodTable,
    PluginRegistry, WindowChannel, WindowContext, WindowFlags,
};

// Configuration types
pub use config::{AgentConfig, LinkConfig, ListenerConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ShellExecId, WindowId};

// Link types
pub use link::{
    ApplicationWindow, GuestLink, GuestLinkBuilder, GuestMetadata, ShellExecOutcome,
    ShellExecRequest, ShellExecState,
};

// Protocol types
pub use protocol::{CommandArgs, GuestCommand, HostEvent, NetworkInfo, WindowEvent};

// Transport types
pub use transport::{GuestListener, LinkState};
