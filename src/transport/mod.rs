//! Byte-stream transport.
//!
//! This module turns a TCP stream into ordered frame payloads and back, and
//! matches incoming guest agents to their host-side links.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  GuestLink      │                              │  Agent          │
//! │  (host)         │        TCP, framed           │  (guest VM)     │
//! │  GuestListener  │◄────────────────────────────►│                 │
//! │  → Connection   │      host:11000              │  Connection     │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `GuestListener::bind` - Bind the controller port
//! 2. The agent connects and sends `register`
//! 3. The listener hands the stream to the link owning that MAC
//! 4. `Connection` - Receive loop plus queued sends
//! 5. `Connection::shutdown` or peer close - state becomes disconnected
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Framed stream, receive loop, [`Outbox`] |
//! | `listener` | Accept loop and `register` handshake |

// ============================================================================
// Submodules
// ============================================================================

/// Framed stream and its receive loop.
pub mod connection;

/// TCP listener for guest agents.
pub mod listener;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, DisconnectReason, FrameHandler, LinkState, Outbox};
pub use listener::GuestListener;
