//! External process termination used by failure and timeout cleanup.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Kills the OS process behind an application module.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Terminates every process matching `process_name`.
    ///
    /// Best effort: callers log the error and carry on.
    async fn terminate(&self, process_name: &str) -> Result<()>;
}

/// Terminator using the platform's kill tool.
///
/// | Platform | Command |
/// |----------|---------|
/// | Windows | `taskkill /IM <name> /F` |
/// | others | `pkill -f <name>` |
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTerminator;

#[async_trait]
impl ProcessTerminator for SystemTerminator {
    async fn terminate(&self, process_name: &str) -> Result<()> {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("taskkill");
            command.args(["/IM", process_name, "/F"]);
            command
        } else {
            let mut command = Command::new("pkill");
            command.args(["-f", process_name]);
            command
        };

        let status = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if status.success() {
            debug!(process_name, "Process terminated");
            Ok(())
        } else {
            Err(Error::handler(format!(
                "terminating {process_name} failed with {status}"
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_matching_process_is_an_error() {
        let err = SystemTerminator
            .terminate("guestlink-no-such-process-5f1c")
            .await;
        // pkill exits 1 when nothing matched; a missing pkill is an I/O error
        assert!(err.is_err());
    }
}
