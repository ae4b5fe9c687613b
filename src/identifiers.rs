//! Type-safe identifiers for link-scoped entities.
//!
//! Newtype wrappers keep window ids and ShellExec ids from being mixed up.
//! Both are allocated by a [`GuestLink`](crate::GuestLink) from its own
//! counters, start at 1 and are never reused while the link lives.
//!
//! | Type | Wire form | Allocated by |
//! |------|-----------|--------------|
//! | [`WindowId`] | decimal `u32` | [`GuestLink::open`](crate::GuestLink::open) |
//! | [`ShellExecId`] | decimal `u64` | [`GuestLink::shell_exec`](crate::GuestLink::shell_exec) |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// WindowId
// ============================================================================

/// Identifier of an application window, unique within one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(u32);

impl WindowId {
    /// Creates a window id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WindowId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| Error::invalid_argument(format!("invalid window id: {s:?}")))
    }
}

// ============================================================================
// ShellExecId
// ============================================================================

/// Identifier correlating a `shellExec` request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellExecId(u64);

impl ShellExecId {
    /// Creates a ShellExec id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShellExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShellExecId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| Error::invalid_argument(format!("invalid shellExec id: {s:?}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
