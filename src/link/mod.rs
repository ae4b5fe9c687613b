//! Host-side view of one guest.
//!
//! A [`GuestLink`] stands for one guest VM. It owns the connection to the
//! guest's agent (through an [`Outbox`], so handles survive a reconnect), the
//! application windows opened on the guest, the ShellExec correlation table
//! and the metadata the guest reported.
//!
//! # Example
//!
//! ```ignore
//! use guestlink::{GuestLink, GuestListener, ListenerConfig};
//!
//! let link = GuestLink::builder("win10-analysis")
//!     .mac("52:54:00:12:34:56")
//!     .registry(registry)
//!     .build()?;
//!
//! let listener = GuestListener::bind(ListenerConfig::default()).await?;
//! listener.register_guest(link.clone());
//! link.wait_until_connected(Duration::from_secs(300)).await?;
//!
//! let window = link.open("fileManagement", &[] as &[&str])?;
//! window.invoke("recycle", &["C:\\Users\\bob\\notes.txt"])?;
//! ```
//!
//! # Inbound Events
//!
//! | Payload | Effect |
//! |---------|--------|
//! | `application <module> <id> <events…>` | window flags updated, host handler notified |
//! | `shellExecComplete <id> …` | request completed |
//! | `time` / `tzone` / `info` / `register` | metadata updated |
//! | anything else | logged and dropped |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::application::{PluginRegistry, WindowChannel};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ShellExecId, WindowId};
use crate::protocol::command::UNSET_PREFIX;
use crate::protocol::{
    CommandArgs, FrameDecoder, GuestCommand, HostEvent, NetworkInfo, RemoteShellExecCommand,
    ShellExecCommand,
};
use crate::transport::{Connection, DisconnectReason, FrameHandler, LinkState, Outbox};

// ============================================================================
// Submodules
// ============================================================================

/// Maintenance commands: clock, timezone, elevation, cleanup.
mod maintenance;

/// ShellExec requests and their correlation table.
pub mod shell;

/// File and directory transfer.
mod transfer;

/// Host-side application window handle.
pub mod window;

// ============================================================================
// Re-exports
// ============================================================================

pub use shell::{ShellExecOutcome, ShellExecRequest, ShellExecState};
pub use transfer::{build_archive, join_guest_path};
pub use window::ApplicationWindow;

use shell::{Completion, ShellExecTable};

// ============================================================================
// GuestMetadata
// ============================================================================

/// What the guest last reported about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuestMetadata {
    /// Guest date from the last `time` event.
    pub date: Option<String>,
    /// Guest time of day from the last `time` event.
    pub time: Option<String>,
    /// Guest timezone from the last `tzone` event.
    pub timezone: Option<String>,
    /// Last `info` document; non-JSON payloads are kept as a string.
    pub info: Option<serde_json::Value>,
    /// Addresses announced in the `register` handshake.
    pub network: Option<NetworkInfo>,
}

// ============================================================================
// GuestLinkBuilder
// ============================================================================

/// Builder for [`GuestLink`].
#[derive(Debug, Clone)]
pub struct GuestLinkBuilder {
    name: String,
    macs: Vec<String>,
    registry: Option<Arc<PluginRegistry>>,
    config: LinkConfig,
}

impl GuestLinkBuilder {
    /// Adds a MAC address the guest may register with.
    #[inline]
    #[must_use]
    pub fn mac(mut self, mac: impl AsRef<str>) -> Self {
        self.macs.push(mac.as_ref().to_ascii_lowercase());
        self
    }

    /// Sets the application registry.
    #[inline]
    #[must_use]
    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the link configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the link, initially disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is empty or the configuration is
    /// invalid.
    pub fn build(self) -> Result<GuestLink> {
        if self.name.trim().is_empty() {
            return Err(Error::config("guest name must not be empty"));
        }
        self.config.validate()?;

        Ok(GuestLink {
            inner: Arc::new(LinkInner {
                name: self.name,
                macs: self.macs,
                registry: self.registry.unwrap_or_default(),
                config: self.config,
                outbox: Outbox::new(),
                next_window_id: AtomicU32::new(1),
                windows: Mutex::new(FxHashMap::default()),
                shell: ShellExecTable::default(),
                metadata: Mutex::new(GuestMetadata::default()),
            }),
        })
    }
}

// ============================================================================
// GuestLink
// ============================================================================

/// Host-side handle to one guest.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct GuestLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    name: String,
    macs: Vec<String>,
    registry: Arc<PluginRegistry>,
    config: LinkConfig,
    outbox: Outbox,
    next_window_id: AtomicU32,
    windows: Mutex<FxHashMap<String, Vec<ApplicationWindow>>>,
    shell: ShellExecTable,
    metadata: Mutex<GuestMetadata>,
}

impl GuestLink {
    /// Starts building a link for the guest called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> GuestLinkBuilder {
        GuestLinkBuilder {
            name: name.into(),
            macs: Vec::new(),
            registry: None,
            config: LinkConfig::default(),
        }
    }

    /// Returns the guest name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the lowercase MAC addresses the guest may register with.
    #[inline]
    #[must_use]
    pub fn macs(&self) -> &[String] {
        &self.inner.macs
    }

    /// Returns the link configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Returns the application registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// Returns the connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.inner.outbox.state()
    }

    /// Returns `true` while the guest is connected.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Returns the outbox shared by every window and request of this link.
    #[inline]
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Adopts an accepted stream as the guest's connection.
    ///
    /// A previous connection is shut down. Must be called from within a
    /// tokio runtime.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let decoder = FrameDecoder::new(self.inner.config.max_frame_len);
        self.attach_with(stream, decoder, Vec::new(), None);
    }

    /// Adopts a stream whose handshake was already read.
    ///
    /// The decoder and whatever it still buffers are held to this link's
    /// `max_frame_len` from here on.
    pub(crate) fn attach_with<S>(
        &self,
        stream: S,
        mut decoder: FrameDecoder,
        pending: Vec<Vec<u8>>,
        network: Option<NetworkInfo>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        decoder.set_max_len(self.inner.config.max_frame_len);
        if let Some(network) = network {
            self.inner.metadata.lock().network = Some(network);
        }

        let handler: Arc<dyn FrameHandler> = Arc::new(LinkFrameHandler {
            link: Arc::downgrade(&self.inner),
        });
        let connection = Connection::spawn_with(
            stream,
            decoder,
            pending,
            handler,
            self.inner.config.read_chunk_size,
        );
        self.inner.outbox.replace(connection);

        info!(guest = %self.inner.name, "Guest connected");
    }

    /// Closes the connection. Windows and pending requests are kept.
    pub fn disconnect(&self) {
        self.inner.outbox.close();
        info!(guest = %self.inner.name, "Guest disconnected by host");
    }

    /// Polls until the guest is connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionTimeout`] if `limit` elapses first.
    pub async fn wait_until_connected(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return Err(Error::connection_timeout(
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                ));
            }
            sleep(self.inner.config.connect_poll_interval).await;
        }
        Ok(())
    }

    /// Sends a raw payload to the agent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.inner.outbox.send(payload)
    }

    fn send_command(&self, command: &GuestCommand) -> Result<()> {
        self.inner.outbox.send(command.to_payload())
    }

    // ------------------------------------------------------------------------
    // Application Windows
    // ------------------------------------------------------------------------

    /// Opens an application on the guest.
    ///
    /// Allocates the next window id, creates the module's host handler,
    /// registers the window and sends `open`. The window is registered before
    /// the command leaves, so the guest's `opened` always finds it.
    ///
    /// # Arguments
    ///
    /// * `module` - Registered module name
    /// * `args` - Arguments of the guest's `open` method
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownModule`] if `module` is not registered
    /// - [`Error::ConnectionClosed`] if the guest is not connected
    /// - any error of the module's host constructor
    pub fn open<A: AsRef<[u8]>>(&self, module: &str, args: &[A]) -> Result<ApplicationWindow> {
        let (host, _) = self.inner.registry.resolve(module)?;
        let args = CommandArgs::new(args.iter().map(|arg| arg.as_ref().to_vec()));

        let window_id = WindowId::new(self.inner.next_window_id.fetch_add(1, Ordering::Relaxed));
        let channel = WindowChannel::new(module, window_id, self.inner.outbox.clone());
        let handler = host.create(channel.clone(), &args)?;
        let window = ApplicationWindow::new(channel.clone(), handler);

        self.inner
            .windows
            .lock()
            .entry(module.to_string())
            .or_default()
            .push(window.clone());

        if let Err(e) = channel.send_call("open", args) {
            self.remove_window(module, window_id);
            return Err(e);
        }

        info!(guest = %self.inner.name, module, %window_id, "Application opened");
        Ok(window)
    }

    /// Windows of `module`, in opening order.
    #[must_use]
    pub fn windows(&self, module: &str) -> Vec<ApplicationWindow> {
        self.inner
            .windows
            .lock()
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks up one window.
    #[must_use]
    pub fn window(&self, module: &str, window_id: WindowId) -> Option<ApplicationWindow> {
        self.inner
            .windows
            .lock()
            .get(module)?
            .iter()
            .find(|window| window.id() == window_id)
            .cloned()
    }

    /// Total number of windows across modules.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.inner.windows.lock().values().map(Vec::len).sum()
    }

    /// Removes a window from the registry.
    ///
    /// Events for it are ignored afterwards; its id is never reused.
    pub fn remove_window(&self, module: &str, window_id: WindowId) -> Option<ApplicationWindow> {
        let mut windows = self.inner.windows.lock();
        let list = windows.get_mut(module)?;
        let index = list.iter().position(|window| window.id() == window_id)?;
        let window = list.remove(index);
        if list.is_empty() {
            windows.remove(module);
        }
        Some(window)
    }

    // ------------------------------------------------------------------------
    // ShellExec
    // ------------------------------------------------------------------------

    /// Runs a shell command on the guest.
    ///
    /// # Arguments
    ///
    /// * `command` - Command line
    /// * `path_prefix` - Text prepended to the command line, such as the
    ///   directory of the executable
    /// * `stdin` - Data written to the command's standard input
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected; the
    /// allocated id is then skipped, never reused.
    pub fn shell_exec(
        &self,
        command: &str,
        path_prefix: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ShellExecRequest> {
        let request = self.inner.shell.allocate(command, self.inner.outbox.clone());
        let payload = GuestCommand::ShellExec(ShellExecCommand {
            id: request.id(),
            command: command.to_string(),
            path_prefix: path_prefix.map(str::to_string),
            stdin: stdin.map(<[u8]>::to_vec),
        });

        self.send_request(&request, &payload)?;
        Ok(request)
    }

    /// Uploads an executable and runs it as a ShellExec.
    ///
    /// The file lands in `target_dir`, or in the agent's working directory
    /// when `None`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the local file cannot be read
    /// - [`Error::InvalidArgument`] if the path has no file name
    /// - [`Error::ConnectionClosed`] if the guest is not connected
    pub async fn remote_shell_exec(
        &self,
        executable: impl AsRef<std::path::Path>,
        target_dir: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ShellExecRequest> {
        let executable = executable.as_ref();
        let file_name = transfer::file_name(executable)?;
        let contents = tokio::fs::read(executable).await?;

        let request = self.inner.shell.allocate(&file_name, self.inner.outbox.clone());
        let payload = GuestCommand::RemoteShellExec(RemoteShellExecCommand {
            id: request.id(),
            file_name,
            contents,
            target_dir: target_dir.unwrap_or(UNSET_PREFIX).to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
        });

        self.send_request(&request, &payload)?;
        Ok(request)
    }

    fn send_request(&self, request: &ShellExecRequest, payload: &GuestCommand) -> Result<()> {
        if let Err(e) = self.send_command(payload) {
            self.inner.shell.discard(request.id());
            return Err(e);
        }
        debug!(guest = %self.inner.name, id = %request.id(), command = request.command(), "ShellExec sent");
        Ok(())
    }

    /// Asks the guest to interrupt a running ShellExec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the guest is not connected.
    pub fn kill_shell_exec(&self, id: ShellExecId) -> Result<()> {
        self.send_command(&GuestCommand::KillShellExec { id })
    }

    /// Looks up a ShellExec request by id.
    #[must_use]
    pub fn shell_exec_request(&self, id: ShellExecId) -> Option<ShellExecRequest> {
        self.inner.shell.get(id)
    }

    /// Number of ShellExec requests still running.
    #[must_use]
    pub fn running_shell_execs(&self) -> usize {
        self.inner.shell.running_count()
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    /// Returns a snapshot of the guest metadata.
    #[must_use]
    pub fn metadata(&self) -> GuestMetadata {
        self.inner.metadata.lock().clone()
    }
}

impl fmt::Debug for GuestLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestLink")
            .field("name", &self.inner.name)
            .field("macs", &self.inner.macs)
            .field("state", &self.state())
            .field("windows", &self.window_count())
            .finish()
    }
}

// ============================================================================
// Inbound Events
// ============================================================================

impl LinkInner {
    fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::Application {
                module,
                window_id,
                events,
            } => {
                let window = self.windows.lock().get(&module).and_then(|list| {
                    list.iter().find(|window| window.id() == window_id).cloned()
                });
                match window {
                    // handler callbacks run outside the registry lock
                    Some(window) => events.into_iter().for_each(|event| window.apply(event)),
                    None => {
                        warn!(guest = %self.name, %module, %window_id, "Event for unknown window");
                    }
                }
            }

            HostEvent::ShellExecComplete {
                id,
                exit_code,
                stdout,
                stderr,
            } => {
                let outcome = ShellExecOutcome {
                    exit_code,
                    stdout,
                    stderr,
                };
                match self.shell.complete(id, outcome) {
                    Completion::Completed => {
                        debug!(guest = %self.name, %id, exit_code, "ShellExec complete");
                    }
                    Completion::Duplicate => {
                        warn!(guest = %self.name, %id, "Duplicate ShellExec completion ignored");
                    }
                    Completion::Unknown => {
                        warn!(guest = %self.name, %id, "Completion for unknown ShellExec");
                    }
                }
            }

            HostEvent::Time { date, time } => {
                debug!(guest = %self.name, %date, %time, "Guest time");
                let mut metadata = self.metadata.lock();
                metadata.date = Some(date);
                metadata.time = Some(time);
            }

            HostEvent::Timezone(zone) => {
                debug!(guest = %self.name, %zone, "Guest timezone");
                self.metadata.lock().timezone = Some(zone);
            }

            HostEvent::Info(raw) => {
                let info = serde_json::from_slice(&raw).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&raw).into_owned())
                });
                self.metadata.lock().info = Some(info);
            }

            HostEvent::Register(network) => {
                debug!(guest = %self.name, mac = %network.mac, "Guest re-registered");
                self.metadata.lock().network = Some(network);
            }
        }
    }
}

/// Receive-loop adapter of a link.
struct LinkFrameHandler {
    link: Weak<LinkInner>,
}

impl FrameHandler for LinkFrameHandler {
    fn on_frame(&self, payload: Vec<u8>) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        match HostEvent::parse(&payload) {
            Ok(event) => link.handle_event(event),
            Err(e) => warn!(guest = %link.name, error = %e, "Dropping frame"),
        }
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        let running = link.shell.running_count();
        if running > 0 {
            warn!(guest = %link.name, %reason, running, "Guest lost with ShellExec requests running");
        } else {
            info!(guest = %link.name, %reason, "Guest connection closed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
