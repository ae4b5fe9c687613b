//! ShellExec requests and their correlation table.
//!
//! Every request gets the next id from a per-link counter starting at 1. The
//! guest answers with `shellExecComplete <id> <exit> <stdout> <stderr>`; the
//! receive loop finds the request by id and completes it. Ids are never
//! reused, and a request only leaves `Running` through that completion.
//!
//! # Example
//!
//! ```ignore
//! let request = link.shell_exec("ipconfig /all", None, None)?;
//! let outcome = request
//!     .wait_timeout(Duration::from_secs(1), Duration::from_secs(120))
//!     .await?;
//! println!("{}", outcome.stdout_lossy());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::{sleep, timeout};

use crate::error::{Error, Result};
use crate::identifiers::ShellExecId;
use crate::protocol::GuestCommand;
use crate::transport::Outbox;

// ============================================================================
// ShellExecState / ShellExecOutcome
// ============================================================================

/// Lifecycle of a ShellExec request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShellExecState {
    /// Sent, no completion received yet.
    Running,
    /// Completion received.
    Complete,
}

/// Result of a finished shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellExecOutcome {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ShellExecOutcome {
    /// Returns `true` for exit code 0.
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output as text, invalid UTF-8 replaced.
    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error as text, invalid UTF-8 replaced.
    #[must_use]
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

// ============================================================================
// ShellExecRequest
// ============================================================================

/// Handle to one ShellExec request.
///
/// Cheap to clone; the link's table holds a clone too.
#[derive(Clone)]
pub struct ShellExecRequest {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: ShellExecId,
    command: String,
    outcome: Mutex<Option<ShellExecOutcome>>,
    outbox: Outbox,
}

impl ShellExecRequest {
    fn new(id: ShellExecId, command: String, outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                command,
                outcome: Mutex::new(None),
                outbox,
            }),
        }
    }

    /// Returns the correlation id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ShellExecId {
        self.inner.id
    }

    /// Returns the command line as sent.
    #[inline]
    #[must_use]
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ShellExecState {
        if self.inner.outcome.lock().is_some() {
            ShellExecState::Complete
        } else {
            ShellExecState::Running
        }
    }

    /// Returns `true` once the completion arrived.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state() == ShellExecState::Complete
    }

    /// Returns the outcome, if complete.
    #[must_use]
    pub fn outcome(&self) -> Option<ShellExecOutcome> {
        self.inner.outcome.lock().clone()
    }

    /// Polls until the request completes.
    ///
    /// Never returns if the guest never answers; see
    /// [`wait_timeout`](Self::wait_timeout).
    pub async fn wait(&self, poll_interval: Duration) -> ShellExecOutcome {
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            sleep(poll_interval).await;
        }
    }

    /// Polls until the request completes or `limit` elapses.
    ///
    /// The request itself stays `Running` after a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no completion arrived within `limit`.
    pub async fn wait_timeout(
        &self,
        poll_interval: Duration,
        limit: Duration,
    ) -> Result<ShellExecOutcome> {
        timeout(limit, self.wait(poll_interval))
            .await
            .map_err(|_| Error::timeout(format!("shellExec {}", self.id()), duration_ms(limit)))
    }

    /// Waits for every request, returning outcomes in input order.
    pub async fn wait_all(requests: &[Self], poll_interval: Duration) -> Vec<ShellExecOutcome> {
        join_all(requests.iter().map(|request| request.wait(poll_interval))).await
    }

    /// Asks the guest to interrupt the command.
    ///
    /// The request still completes through the guest's `shellExecComplete`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the link is down.
    pub fn kill(&self) -> Result<()> {
        self.inner
            .outbox
            .send(GuestCommand::KillShellExec { id: self.id() }.to_payload())
    }

    /// Stores the outcome; `false` if already complete.
    fn complete(&self, outcome: ShellExecOutcome) -> bool {
        let mut slot = self.inner.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }
}

impl fmt::Debug for ShellExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellExecRequest")
            .field("id", &self.id())
            .field("command", &self.command())
            .field("state", &self.state())
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// ShellExecTable
// ============================================================================

/// Outcome of feeding a completion into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The request moved to `Complete`.
    Completed,
    /// The request had already completed.
    Duplicate,
    /// No request with that id.
    Unknown,
}

/// Id allocator plus id → request map of one link.
pub(crate) struct ShellExecTable {
    next_id: AtomicU64,
    requests: Mutex<FxHashMap<ShellExecId, ShellExecRequest>>,
}

impl Default for ShellExecTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            requests: Mutex::new(FxHashMap::default()),
        }
    }
}

impl ShellExecTable {
    /// Allocates the next id and records a `Running` request.
    pub(crate) fn allocate(&self, command: &str, outbox: Outbox) -> ShellExecRequest {
        let id = ShellExecId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = ShellExecRequest::new(id, command.to_string(), outbox);
        self.requests.lock().insert(id, request.clone());
        request
    }

    /// Drops a request that never made it onto the wire.
    pub(crate) fn discard(&self, id: ShellExecId) {
        self.requests.lock().remove(&id);
    }

    pub(crate) fn complete(&self, id: ShellExecId, outcome: ShellExecOutcome) -> Completion {
        let request = self.requests.lock().get(&id).cloned();
        match request {
            Some(request) if request.complete(outcome) => Completion::Completed,
            Some(_) => Completion::Duplicate,
            None => Completion::Unknown,
        }
    }

    pub(crate) fn get(&self, id: ShellExecId) -> Option<ShellExecRequest> {
        self.requests.lock().get(&id).cloned()
    }

    /// Number of requests still `Running`.
    pub(crate) fn running_count(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|request| !request.is_complete())
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(code: i32) -> ShellExecOutcome {
        ShellExecOutcome {
            exit_code: code,
            stdout: b"hello\n".to_vec(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn test_ids_start_at_one() {
        let table = ShellExecTable::default();
        let first = table.allocate("whoami", Outbox::new());
        let second = table.allocate("hostname", Outbox::new());
        assert_eq!(first.id(), ShellExecId::new(1));
        assert_eq!(second.id(), ShellExecId::new(2));
        assert_eq!(table.running_count(), 2);
    }

    #[test]
    fn test_completion_by_id() {
        let table = ShellExecTable::default();
        let request = table.allocate("echo hello", Outbox::new());
        assert_eq!(request.state(), ShellExecState::Running);

        assert_eq!(table.complete(request.id(), outcome(0)), Completion::Completed);
        assert_eq!(request.state(), ShellExecState::Complete);
        assert_eq!(request.outcome().expect("outcome").stdout_lossy(), "hello\n");
        assert_eq!(table.running_count(), 0);
    }

    #[test]
    fn test_completion_is_write_once() {
        let table = ShellExecTable::default();
        let request = table.allocate("exit 3", Outbox::new());
        table.complete(request.id(), outcome(3));

        assert_eq!(table.complete(request.id(), outcome(0)), Completion::Duplicate);
        assert_eq!(request.outcome().expect("outcome").exit_code, 3);
    }

    #[test]
    fn test_unknown_completion() {
        let table = ShellExecTable::default();
        assert_eq!(
            table.complete(ShellExecId::new(42), outcome(0)),
            Completion::Unknown
        );
    }

    #[test]
    fn test_discard_keeps_counter() {
        let table = ShellExecTable::default();
        let request = table.allocate("dir", Outbox::new());
        table.discard(request.id());
        assert!(table.get(request.id()).is_none());
        assert_eq!(table.allocate("dir", Outbox::new()).id(), ShellExecId::new(2));
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_request_running() {
        let table = ShellExecTable::default();
        let request = table.allocate("sleep 60", Outbox::new());

        let err = request
            .wait_timeout(Duration::from_millis(5), Duration::from_millis(30))
            .await
            .expect_err("no completion");
        assert!(err.is_timeout());
        assert_eq!(request.state(), ShellExecState::Running);
    }

    #[tokio::test]
    async fn test_wait_all_in_input_order() {
        let table = Arc::new(ShellExecTable::default());
        let first = table.allocate("a", Outbox::new());
        let second = table.allocate("b", Outbox::new());

        let completer = Arc::clone(&table);
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            completer.complete(ShellExecId::new(2), outcome(2));
            completer.complete(ShellExecId::new(1), outcome(1));
        });

        let outcomes = ShellExecRequest::wait_all(&[first, second], Duration::from_millis(2)).await;
        let codes: Vec<i32> = outcomes.iter().map(|o| o.exit_code).collect();
        assert_eq!(codes, vec![1, 2]);
    }

    #[test]
    fn test_kill_without_link() {
        let table = ShellExecTable::default();
        let request = table.allocate("ping -t localhost", Outbox::new());
        assert!(matches!(request.kill(), Err(Error::ConnectionClosed)));
    }
}
