//! Module name → factories table.
//!
//! Populated once at startup by the code that links the application modules
//! in, then shared read-only (`Arc<PluginRegistry>`) by every link and agent.
//! Bad names and duplicates fail at registration; an unregistered name fails
//! with [`Error::UnknownModule`] when resolved.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, Result};

use super::{GuestFactory, HostFactory};

// ============================================================================
// PluginRegistry
// ============================================================================

/// Both halves of one module.
#[derive(Debug, Clone)]
struct PluginEntry {
    host: HostFactory,
    guest: GuestFactory,
}

/// Explicit table of application modules.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    modules: FxHashMap<String, PluginEntry>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module.
    ///
    /// # Arguments
    ///
    /// * `name` - Module name used on the wire (a single token)
    /// * `host` - Factory for the host half
    /// * `guest` - Factory and method table for the guest half
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `name` is empty or contains whitespace
    /// - [`Error::DuplicateModule`] if `name` is already registered
    pub fn register(
        &mut self,
        name: impl Into<String>,
        host: HostFactory,
        guest: GuestFactory,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(Error::config(format!("invalid module name {name:?}")));
        }
        if self.modules.contains_key(&name) {
            return Err(Error::duplicate_module(name));
        }

        debug!(module = %name, "Module registered");
        self.modules.insert(name, PluginEntry { host, guest });
        Ok(())
    }

    /// Registers a module, builder style.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn with_module(
        mut self,
        name: impl Into<String>,
        host: HostFactory,
        guest: GuestFactory,
    ) -> Result<Self> {
        self.register(name, host, guest)?;
        Ok(self)
    }

    /// Looks up both factories of a module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownModule`] if the module is not registered.
    pub fn resolve(&self, name: &str) -> Result<(&HostFactory, &GuestFactory)> {
        self.modules
            .get(name)
            .map(|entry| (&entry.host, &entry.guest))
            .ok_or_else(|| Error::unknown_module(name))
    }

    /// Returns `true` if `name` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered module names, sorted.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Tests
// ============================================================================
