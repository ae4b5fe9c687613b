//! Guest side of the control channel.
//!
//! The [`Agent`] runs inside the guest VM. It dials the host's
//! [`GuestListener`](crate::GuestListener), announces itself with `register`
//! and `info`, then executes whatever the host sends.
//!
//! # Command Routing
//!
//! | Verb | Executed by | Reply |
//! |------|-------------|-------|
//! | `application` | [`Dispatcher`] | window events |
//! | `shellExec` / `remoteShellExec` | ShellExec runner | `shellExecComplete` |
//! | `killShellExec` | ShellExec runner | the interrupted run's `shellExecComplete` |
//! | `file` | file worker | none |
//! | `guesttime` / `guesttzone` | [`Clock`] | `time` / `tzone` |
//! | `setOSTime` / `runElevated` / `cleanUp` / `initClean` | [`SystemOps`] | none |
//!
//! File operations and ShellExec launches go through one ordered queue, so
//! `dircreate x`, `guestchdir x`, `shellExec …` apply in the order sent.
//!
//! # Example
//!
//! ```ignore
//! let agent = Agent::builder()
//!     .registry(Arc::new(registry))
//!     .config(AgentConfig::from_json(&config_text)?)
//!     .build()?;
//!
//! agent.connect("192.168.56.1:11000", &network).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::PluginRegistry;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::protocol::command::UNSET_PREFIX;
use crate::protocol::{
    FileCommand, GuestCommand, HostEvent, NetworkInfo, RemoteShellExecCommand, ShellExecCommand,
};
use crate::transport::{Connection, DisconnectReason, FrameHandler, LinkState, Outbox};

// ============================================================================
// Submodules
// ============================================================================

/// Time source for `guesttime` and `guesttzone`.
pub mod clock;

/// Application call dispatch and timeout cleanup.
pub mod dispatcher;

/// File operations.
pub mod files;

/// Process termination.
pub mod process;

/// ShellExec execution.
mod shell;

/// OS maintenance operations.
pub mod system;

// ============================================================================
// Re-exports
// ============================================================================

pub use clock::{Clock, LocalClock};
pub use dispatcher::Dispatcher;
pub use files::WorkingDir;
pub use process::{ProcessTerminator, SystemTerminator};
pub use system::{SystemOps, UnsupportedSystemOps};

use shell::ShellRunner;

// ============================================================================
// AgentBuilder
// ============================================================================

/// Builder for [`Agent`].
pub struct AgentBuilder {
    registry: Option<Arc<PluginRegistry>>,
    config: AgentConfig,
    terminator: Arc<dyn ProcessTerminator>,
    clock: Arc<dyn Clock>,
    system: Arc<dyn SystemOps>,
}

impl AgentBuilder {
    /// Sets the application registry.
    #[inline]
    #[must_use]
    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the agent configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the process terminator used by cleanup.
    #[inline]
    #[must_use]
    pub fn terminator(mut self, terminator: Arc<dyn ProcessTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Sets the clock answering `guesttime` and `guesttzone`.
    #[inline]
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the OS maintenance implementation.
    #[inline]
    #[must_use]
    pub fn system(mut self, system: Arc<dyn SystemOps>) -> Self {
        self.system = system;
        self
    }

    /// Builds the agent, initially disconnected.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::Io`] if no working directory is configured and the process
    ///   one cannot be read
    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;
        let working_dir = match &self.config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let outbox = Outbox::new();
        let dispatcher = Arc::new(Dispatcher::new(
            self.registry.unwrap_or_default(),
            outbox.clone(),
            self.terminator,
            self.config.default_method_timeout,
        ));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        Ok(Agent {
            inner: Arc::new(AgentInner {
                shell: Arc::new(ShellRunner::new(self.config.shell_exec_timeout)),
                working_dir: WorkingDir::new(working_dir),
                config: self.config,
                outbox,
                dispatcher,
                clock: self.clock,
                system: self.system,
                jobs: jobs_tx,
                pending_jobs: Mutex::new(Some(jobs_rx)),
            }),
        })
    }
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Work that must run in arrival order.
enum Job {
    File(FileCommand),
    ShellExec(ShellExecCommand),
    RemoteShellExec(RemoteShellExecCommand),
}

/// Guest agent.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    outbox: Outbox,
    dispatcher: Arc<Dispatcher>,
    shell: Arc<ShellRunner>,
    working_dir: WorkingDir,
    clock: Arc<dyn Clock>,
    system: Arc<dyn SystemOps>,
    jobs: mpsc::UnboundedSender<Job>,
    pending_jobs: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl Agent {
    /// Starts building an agent with the default collaborators.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder {
            registry: None,
            config: AgentConfig::default(),
            terminator: Arc::new(SystemTerminator),
            clock: Arc::new(LocalClock),
            system: Arc::new(UnsupportedSystemOps),
        }
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Returns the application dispatcher.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Returns the current working directory.
    #[inline]
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.inner.working_dir.get()
    }

    /// Returns the connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.inner.outbox.state()
    }

    /// Returns `true` while connected to the host.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Number of ShellExecs still running.
    #[must_use]
    pub fn running_shell_execs(&self) -> usize {
        self.inner.shell.running_count()
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Dials the host and announces the guest.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the host cannot be reached
    /// - [`Error::ConnectionClosed`] if the link drops during the handshake
    pub async fn connect(&self, addr: impl ToSocketAddrs, network: &NetworkInfo) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connection(format!("cannot reach host: {e}")))?;
        stream.set_nodelay(true)?;
        self.attach(stream);
        self.announce(network)
    }

    /// Serves commands arriving on `stream`, replacing any earlier one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.start_job_worker();

        let handler: Arc<dyn FrameHandler> = Arc::new(AgentFrameHandler {
            agent: Arc::downgrade(&self.inner),
        });
        let connection = Connection::spawn(stream, handler, &self.inner.config.link);
        self.inner.outbox.replace(connection);
        info!("Agent connected");
    }

    /// Sends `register` and `info`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if not connected.
    pub fn announce(&self, network: &NetworkInfo) -> Result<()> {
        let info = serde_json::json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agent_version": env!("CARGO_PKG_VERSION"),
            "working_dir": self.working_dir().display().to_string(),
            "network": network,
        });
        self.inner
            .outbox
            .send(HostEvent::Register(network.clone()).to_payload())?;
        self.inner
            .outbox
            .send(HostEvent::Info(serde_json::to_vec(&info)?).to_payload())?;
        debug!(mac = %network.mac, "Agent announced");
        Ok(())
    }

    /// Closes the connection.
    pub fn disconnect(&self) {
        self.inner.outbox.close();
        info!("Agent disconnected");
    }

    fn start_job_worker(&self) {
        let Some(jobs) = self.inner.pending_jobs.lock().take() else {
            return;
        };
        let worker = JobWorker {
            outbox: self.inner.outbox.clone(),
            shell: Arc::clone(&self.inner.shell),
            working_dir: self.inner.working_dir.clone(),
            file_op_timeout: self.inner.config.file_op_timeout,
        };
        tokio::spawn(worker.run(jobs));
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("state", &self.state())
            .field("working_dir", &self.working_dir())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Routing
// ============================================================================

impl AgentInner {
    fn handle_command(&self, command: GuestCommand) {
        match command {
            GuestCommand::Application(call) => self.dispatcher.dispatch(call),

            GuestCommand::ShellExec(exec) => self.enqueue(Job::ShellExec(exec)),
            GuestCommand::RemoteShellExec(exec) => self.enqueue(Job::RemoteShellExec(exec)),
            GuestCommand::File(file) => self.enqueue(Job::File(file)),

            GuestCommand::KillShellExec { id } => {
                if !self.shell.kill(id) {
                    debug!(%id, "Kill for a ShellExec that is not running");
                }
            }

            GuestCommand::GuestTime => {
                let (date, time) = clock::format_time(&self.clock.now());
                self.reply(&HostEvent::Time { date, time });
            }

            GuestCommand::GuestTimezone => {
                self.reply(&HostEvent::Timezone(self.clock.timezone()));
            }

            GuestCommand::SetOsTime { time, local } => {
                self.run_system("setOSTime", move |system| system.set_os_time(&time, local));
            }
            GuestCommand::RunElevated { command } => {
                self.run_system("runElevated", move |system| system.run_elevated(&command));
            }
            GuestCommand::CleanUp { mode } => {
                self.run_system("cleanUp", move |system| system.clean_up(&mode));
            }
            GuestCommand::InitClean => {
                self.run_system("initClean", |system| system.init_clean());
            }
        }
    }

    fn enqueue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Job worker stopped, dropping command");
        }
    }

    fn reply(&self, event: &HostEvent) {
        if let Err(e) = self.outbox.send(event.to_payload()) {
            warn!(error = %e, "Reply lost");
        }
    }

    /// Runs one maintenance operation on a blocking worker.
    fn run_system<F>(&self, operation: &'static str, op: F)
    where
        F: FnOnce(&dyn SystemOps) -> Result<()> + Send + 'static,
    {
        let system = Arc::clone(&self.system);
        let limit = self.config.system_timeout;
        tokio::spawn(async move {
            let worker = tokio::task::spawn_blocking(move || op(system.as_ref()));
            match timeout(limit, worker).await {
                Ok(Ok(Ok(()))) => info!(operation, "System operation done"),
                Ok(Ok(Err(e))) => warn!(operation, error = %e, "System operation failed"),
                Ok(Err(e)) => warn!(operation, error = %e, "System operation panicked"),
                Err(_) => warn!(operation, "System operation timed out"),
            }
        });
    }
}

// ============================================================================
// JobWorker
// ============================================================================

/// Applies file operations and launches ShellExecs in arrival order.
struct JobWorker {
    outbox: Outbox,
    shell: Arc<ShellRunner>,
    working_dir: WorkingDir,
    file_op_timeout: std::time::Duration,
}

impl JobWorker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::File(file) => self.apply_file(file).await,
                Job::ShellExec(exec) => self.launch(exec),
                Job::RemoteShellExec(exec) => self.launch_remote(exec).await,
            }
        }
        debug!("Job worker stopped");
    }

    async fn apply_file(&self, file: FileCommand) {
        let sub_verb = file.sub_verb();
        let cwd = self.working_dir.clone();
        let worker = tokio::task::spawn_blocking(move || files::apply(file, &cwd));
        match timeout(self.file_op_timeout, worker).await {
            Ok(Ok(Ok(()))) => debug!(sub_verb, "File operation done"),
            Ok(Ok(Err(e))) => warn!(sub_verb, error = %e, "File operation failed"),
            Ok(Err(e)) => warn!(sub_verb, error = %e, "File operation panicked"),
            Err(_) => warn!(sub_verb, "File operation timed out"),
        }
    }

    fn launch(&self, exec: ShellExecCommand) {
        let line = match &exec.path_prefix {
            Some(prefix) => format!("{prefix}{}", exec.command),
            None => exec.command,
        };
        debug!(id = %exec.id, %line, "ShellExec");
        self.shell.spawn(
            exec.id,
            ShellRunner::shell_command(&line),
            self.working_dir.get(),
            exec.stdin,
            self.outbox.clone(),
        );
    }

    async fn launch_remote(&self, exec: RemoteShellExecCommand) {
        let dir = if exec.target_dir.is_empty() || exec.target_dir == UNSET_PREFIX {
            self.working_dir.get()
        } else {
            self.working_dir.resolve(&exec.target_dir)
        };

        let path = match write_executable(&dir, &exec.file_name, &exec.contents).await {
            Ok(path) => path,
            Err(e) => {
                warn!(id = %exec.id, error = %e, "Remote executable not written");
                ShellRunner::reply_failure(exec.id, &e.to_string(), &self.outbox);
                return;
            }
        };

        debug!(id = %exec.id, path = %path.display(), "Remote ShellExec");
        self.shell.spawn(
            exec.id,
            tokio::process::Command::new(&path),
            dir,
            exec.stdin,
            self.outbox.clone(),
        );
    }
}

/// Writes a shipped executable and marks it runnable.
async fn write_executable(
    dir: &std::path::Path,
    file_name: &str,
    contents: &[u8],
) -> Result<PathBuf> {
    let name = std::path::Path::new(file_name)
        .file_name()
        .ok_or_else(|| Error::invalid_argument(format!("invalid file name {file_name:?}")))?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(path)
}

// ============================================================================
// AgentFrameHandler
// ============================================================================

/// Receive-loop adapter of the agent.
struct AgentFrameHandler {
    agent: Weak<AgentInner>,
}

impl FrameHandler for AgentFrameHandler {
    fn on_frame(&self, payload: Vec<u8>) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        match GuestCommand::parse(&payload) {
            Ok(command) => agent.handle_command(command),
            Err(e) => warn!(error = %e, "Dropping frame"),
        }
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        info!(%reason, "Host connection closed");
    }
}

// ============================================================================
// Tests
// ============================================================================
