//! Guest-side ShellExec runner.
//!
//! Each request runs on its own task, outside the receive loop, bounded by
//! the agent's ShellExec timeout. The reply is always a
//! `shellExecComplete`; spawn failures, kills and timeouts report exit code
//! `-1` with the reason appended to stderr.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifiers::ShellExecId;
use crate::protocol::HostEvent;
use crate::transport::Outbox;

// ============================================================================
// Constants
// ============================================================================

/// Exit code reported when the process produced none.
const NO_EXIT_CODE: i32 = -1;

/// How long output pipes may stay open after a kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// ShellRunner
// ============================================================================

/// How a process run ended.
enum Ending {
    Exited(i32),
    Killed,
    TimedOut,
}

/// Output captured from one run.
struct Captured {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Runs ShellExecs and tracks them for `killShellExec`.
pub(crate) struct ShellRunner {
    limit: Duration,
    running: Mutex<FxHashMap<ShellExecId, oneshot::Sender<()>>>,
}

impl ShellRunner {
    pub(crate) fn new(limit: Duration) -> Self {
        Self {
            limit,
            running: Mutex::new(FxHashMap::default()),
        }
    }

    /// Builds the platform shell invocation of a command line.
    pub(crate) fn shell_command(line: &str) -> Command {
        if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.args(["/C", line]);
            command
        } else {
            let mut command = Command::new("sh");
            command.args(["-c", line]);
            command
        }
    }

    /// Starts `command` and replies when it ends.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        id: ShellExecId,
        command: Command,
        cwd: PathBuf,
        stdin: Option<Vec<u8>>,
        outbox: Outbox,
    ) {
        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().insert(id, kill_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let captured = match this.execute(command, &cwd, stdin, kill_rx).await {
                Ok(captured) => captured,
                Err(e) => {
                    warn!(%id, error = %e, "ShellExec could not start");
                    Captured {
                        exit_code: NO_EXIT_CODE,
                        stdout: Vec::new(),
                        stderr: e.to_string().into_bytes(),
                    }
                }
            };
            this.running.lock().remove(&id);

            debug!(%id, exit_code = captured.exit_code, "ShellExec finished");
            let reply = HostEvent::ShellExecComplete {
                id,
                exit_code: captured.exit_code,
                stdout: captured.stdout,
                stderr: captured.stderr,
            };
            if let Err(e) = outbox.send(reply.to_payload()) {
                warn!(%id, error = %e, "ShellExec result lost");
            }
        });
    }

    /// Reports a request that failed before a process could be built.
    pub(crate) fn reply_failure(id: ShellExecId, message: &str, outbox: &Outbox) {
        let reply = HostEvent::ShellExecComplete {
            id,
            exit_code: NO_EXIT_CODE,
            stdout: Vec::new(),
            stderr: message.as_bytes().to_vec(),
        };
        if let Err(e) = outbox.send(reply.to_payload()) {
            warn!(%id, error = %e, "ShellExec result lost");
        }
    }

    /// Interrupts a running request; `false` if the id is not running.
    pub(crate) fn kill(&self, id: ShellExecId) -> bool {
        match self.running.lock().remove(&id) {
            Some(kill_tx) => kill_tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Number of requests still running.
    pub(crate) fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    async fn execute(
        &self,
        mut command: Command,
        cwd: &Path,
        stdin: Option<Vec<u8>>,
        mut kill_rx: oneshot::Receiver<()>,
    ) -> Result<Captured> {
        command
            .current_dir(cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "ShellExec stdin closed early");
                }
            });
        }
        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?.code().unwrap_or(NO_EXIT_CODE)),
            _ = &mut kill_rx => Ending::Killed,
            () = sleep(self.limit) => Ending::TimedOut,
        };

        let (exit_code, note, grace) = match ending {
            Ending::Exited(code) => (code, None, None),
            Ending::Killed => {
                child.start_kill()?;
                let _ = child.wait().await;
                (NO_EXIT_CODE, Some("killed on request".to_string()), Some(DRAIN_GRACE))
            }
            Ending::TimedOut => {
                child.start_kill()?;
                let _ = child.wait().await;
                let note = format!("timed out after {}s", self.limit.as_secs());
                (NO_EXIT_CODE, Some(note), Some(DRAIN_GRACE))
            }
        };

        let stdout = drain(stdout, grace).await;
        let mut stderr = drain(stderr, grace).await;
        if let Some(note) = note {
            if !stderr.is_empty() && !stderr.ends_with(b"\n") {
                stderr.push(b'\n');
            }
            stderr.extend_from_slice(note.as_bytes());
        }

        Ok(Captured {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn collect<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer).await;
        buffer
    })
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>, grace: Option<Duration>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match grace {
        Some(grace) => timeout(grace, task)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default(),
        None => task.await.unwrap_or_default(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use crate::config::LinkConfig;
    use crate::testing::{FramePeer, RecordingHandler};
    use crate::transport::Connection;

    fn outbox_with_peer() -> (Outbox, FramePeer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let outbox = Outbox::new();
        outbox.replace(Connection::spawn(
            local,
            RecordingHandler::new(),
            &LinkConfig::default(),
        ));
        (outbox, FramePeer::new(remote))
    }

    async fn reply(peer: &mut FramePeer) -> (ShellExecId, i32, Vec<u8>, Vec<u8>) {
        match HostEvent::parse(&peer.recv().await).expect("parse") {
            HostEvent::ShellExecComplete {
                id,
                exit_code,
                stdout,
                stderr,
            } => (id, exit_code, stdout, stderr),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runs_command_with_stdin() {
        let (outbox, mut peer) = outbox_with_peer();
        let runner = Arc::new(ShellRunner::new(Duration::from_secs(10)));

        runner.spawn(
            ShellExecId::new(1),
            ShellRunner::shell_command("cat; echo oops >&2; exit 3"),
            std::env::temp_dir(),
            Some(b"from stdin".to_vec()),
            outbox,
        );

        let (id, exit_code, stdout, stderr) = reply(&mut peer).await;
        assert_eq!(id, ShellExecId::new(1));
        assert_eq!(exit_code, 3);
        assert_eq!(stdout, b"from stdin");
        assert_eq!(stderr, b"oops\n");
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_running_command() {
        let (outbox, mut peer) = outbox_with_peer();
        let runner = Arc::new(ShellRunner::new(Duration::from_secs(30)));

        runner.spawn(
            ShellExecId::new(4),
            ShellRunner::shell_command("exec sleep 30"),
            std::env::temp_dir(),
            None,
            outbox,
        );
        assert!(runner.kill(ShellExecId::new(4)));
        assert!(!runner.kill(ShellExecId::new(99)));

        let (id, exit_code, _, stderr) = reply(&mut peer).await;
        assert_eq!(id, ShellExecId::new(4));
        assert_eq!(exit_code, NO_EXIT_CODE);
        assert!(String::from_utf8_lossy(&stderr).contains("killed"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let (outbox, mut peer) = outbox_with_peer();
        let runner = Arc::new(ShellRunner::new(Duration::from_millis(100)));

        runner.spawn(
            ShellExecId::new(2),
            ShellRunner::shell_command("exec sleep 30"),
            std::env::temp_dir(),
            None,
            outbox,
        );

        let (_, exit_code, _, stderr) = reply(&mut peer).await;
        assert_eq!(exit_code, NO_EXIT_CODE);
        assert!(String::from_utf8_lossy(&stderr).contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_failure_still_replies() {
        let (outbox, mut peer) = outbox_with_peer();
        let runner = Arc::new(ShellRunner::new(Duration::from_secs(5)));

        runner.spawn(
            ShellExecId::new(5),
            Command::new("/definitely/not/a/binary"),
            std::env::temp_dir(),
            None,
            outbox,
        );

        let (id, exit_code, _, stderr) = reply(&mut peer).await;
        assert_eq!(id, ShellExecId::new(5));
        assert_eq!(exit_code, NO_EXIT_CODE);
        assert!(!stderr.is_empty());
    }
}
