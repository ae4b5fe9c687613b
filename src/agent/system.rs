//! OS maintenance operations requested by the host.

use tracing::warn;

use crate::error::{Error, Result};

/// Guest OS operations behind `setOSTime`, `runElevated`, `cleanUp` and
/// `initClean`.
///
/// Methods run on a blocking worker bounded by
/// [`AgentConfig::system_timeout`](crate::AgentConfig::system_timeout).
pub trait SystemOps: Send + Sync {
    /// Sets the OS clock.
    fn set_os_time(&self, time: &str, local: bool) -> Result<()>;

    /// Runs a command with elevated rights.
    fn run_elevated(&self, command: &str) -> Result<()>;

    /// Removes traces of the agent.
    fn clean_up(&self, mode: &str) -> Result<()>;

    /// Prepares the guest for a clean run.
    fn init_clean(&self) -> Result<()>;
}

/// Default that rejects every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedSystemOps;

impl UnsupportedSystemOps {
    fn reject(operation: &str) -> Result<()> {
        warn!(operation, "System operation not supported on this guest");
        Err(Error::handler(format!("{operation} is not supported on this guest")))
    }
}

impl SystemOps for UnsupportedSystemOps {
    fn set_os_time(&self, _time: &str, _local: bool) -> Result<()> {
        Self::reject("setOSTime")
    }

    fn run_elevated(&self, _command: &str) -> Result<()> {
        Self::reject("runElevated")
    }

    fn clean_up(&self, _mode: &str) -> Result<()> {
        Self::reject("cleanUp")
    }

    fn init_clean(&self) -> Result<()> {
        Self::reject("initClean")
    }
}
