//! Application plugins.
//!
//! An application module (browser, mail client, file manager, …) plugs into
//! the channel with two halves registered under one name:
//!
//! | Half | Type | Runs on | Role |
//! |------|------|---------|------|
//! | Host | [`HostFactory`] → [`HostApplication`] | host | typed remote control, event hook |
//! | Guest | [`GuestFactory`] + [`MethodTable`] | guest agent | executes method calls |
//!
//! Resolution is an explicit table built at startup ([`PluginRegistry`]);
//! method names are looked up in a per-module [`MethodTable`], never by
//! reflection.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::protocol::WindowEvent;

// ============================================================================
// Submodules
// ============================================================================

/// Guest-side method tables and invocation context.
pub mod guest;

/// Host-side handler contract.
pub mod host;

/// Module name → factories table.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use guest::{CancelFlag, GuestFactory, Invocation, MethodFn, MethodTable, WindowContext};
pub use host::{HostApplication, HostFactory, WindowChannel};
pub use registry::PluginRegistry;

// ============================================================================
// WindowFlags
// ============================================================================

/// Observable state of an application window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFlags {
    /// The guest reported `opened`.
    pub is_opened: bool,
    /// A method is running (set on send and on `busy`, cleared on `ready`).
    pub is_busy: bool,
    /// The guest reported `error`.
    pub has_error: bool,
}

impl WindowFlags {
    /// Flags of a window whose method timed out.
    pub const TIMED_OUT: Self = Self {
        is_opened: false,
        is_busy: false,
        has_error: true,
    };

    /// Applies one window event.
    pub fn apply(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::Opened => self.is_opened = true,
            WindowEvent::Busy => self.is_busy = true,
            WindowEvent::Ready => self.is_busy = false,
            WindowEvent::Error => self.has_error = true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
