//! Routes `application` calls to guest handlers.
//!
//! # Lifecycle
//!
//! | Call | Before | Success | Failure |
//! |------|--------|---------|---------|
//! | `open` | window created | `opened`, `ready` | cleanup, window removed, module marked crashed, `error` |
//! | `close` | `busy` | window removed, `ready` | `error` |
//! | other | `busy` | `ready` | `error`, window keeps `has_error` |
//!
//! Every call runs on its own blocking worker bounded by the method's
//! timeout (or the agent default). A call that overruns is not preempted:
//! its [`CancelFlag`] is raised and the dispatcher cleans up around it
//! (process terminated, the module's windows dropped, `error` sent).
//!
//! A module stays marked crashed until its next `open`, which clears the
//! mark and starts from a fresh window.
//!
//! Unknown modules, methods and windows are reported as `error` events for
//! the addressed window.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::guest::{BoundHandler, BoundMethod};
use crate::application::{CancelFlag, Invocation, PluginRegistry, WindowContext, WindowFlags};
use crate::error::{Error, Result};
use crate::identifiers::WindowId;
use crate::protocol::{ApplicationCall, WindowEvent};
use crate::transport::Outbox;

use super::process::ProcessTerminator;

/// Method creating a window.
const OPEN: &str = "open";

/// Method removing a window.
const CLOSE: &str = "close";

// ============================================================================
// GuestWindow
// ============================================================================

/// One open application instance on the guest.
struct GuestWindow {
    context: WindowContext,
    handler: Arc<dyn BoundHandler>,
    process_name: String,
    flags: Mutex<WindowFlags>,
    cleaned_up: AtomicBool,
}

impl GuestWindow {
    fn module(&self) -> &str {
        self.context.module()
    }

    fn id(&self) -> WindowId {
        self.context.window_id()
    }

    /// Applies `event` locally and sends it to the host.
    fn emit(&self, event: WindowEvent) {
        self.flags.lock().apply(event);
        if let Err(e) = self.context.send_event(event) {
            debug!(module = %self.module(), window_id = %self.id(), %event, error = %e, "Event not sent");
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Guest-side dispatch engine shared by every module.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    outbox: Outbox,
    terminator: Arc<dyn ProcessTerminator>,
    default_timeout: Duration,
    windows: Mutex<FxHashMap<String, Vec<Arc<GuestWindow>>>>,
    /// Modules whose last `open` failed.
    crashed: Mutex<FxHashSet<String>>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<PluginRegistry>,
        outbox: Outbox,
        terminator: Arc<dyn ProcessTerminator>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            outbox,
            terminator,
            default_timeout,
            windows: Mutex::new(FxHashMap::default()),
            crashed: Mutex::new(FxHashSet::default()),
        }
    }

    /// Number of open windows across modules.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.lock().values().map(Vec::len).sum()
    }

    /// Flags of one window, if it is open.
    #[must_use]
    pub fn window_flags(&self, module: &str, window_id: WindowId) -> Option<WindowFlags> {
        self.find(module, window_id).map(|window| *window.flags.lock())
    }

    /// Returns `true` if the last `open` of `module` failed and no open has
    /// been attempted since.
    #[must_use]
    pub fn is_crashed(&self, module: &str) -> bool {
        self.crashed.lock().contains(module)
    }

    /// Routes one call. Never blocks; failures become `error` events.
    pub fn dispatch(self: &Arc<Self>, call: ApplicationCall) {
        let module = call.module.clone();
        let window_id = call.window_id;
        let method = call.method.clone();

        if let Err(e) = self.route(call) {
            warn!(%module, %window_id, %method, error = %e, "Dispatch failed");
            match self.find(&module, window_id) {
                Some(window) => window.emit(WindowEvent::Error),
                None => self.send_error(&module, window_id),
            }
        }
    }

    fn route(self: &Arc<Self>, call: ApplicationCall) -> Result<()> {
        let ApplicationCall {
            module,
            window_id,
            method,
            args,
        } = call;

        let window = if method == OPEN {
            self.open_window(&module, window_id)?
        } else {
            self.find(&module, window_id)
                .ok_or_else(|| Error::window_not_found(&module, window_id))?
        };

        let Some(bound) = window.handler.bind(&method) else {
            return match method.as_str() {
                OPEN => {
                    window.emit(WindowEvent::Opened);
                    window.emit(WindowEvent::Ready);
                    Ok(())
                }
                CLOSE => {
                    self.remove(&window);
                    window.emit(WindowEvent::Ready);
                    Ok(())
                }
                _ => Err(Error::method_not_found(&module, &method)),
            };
        };

        let cancel = CancelFlag::new();
        let invocation = Invocation::new(window.context.clone(), method, args, cancel.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.supervise(window, bound, invocation, cancel).await;
        });
        Ok(())
    }

    /// Creates and registers the window an `open` addresses.
    fn open_window(
        self: &Arc<Self>,
        module: &str,
        window_id: WindowId,
    ) -> Result<Arc<GuestWindow>> {
        let (_, factory) = self.registry.resolve(module)?;
        if self.crashed.lock().remove(module) {
            info!(module, %window_id, "Reopening after a failed open");
        }
        let process_name = factory.process_name().unwrap_or(module).to_string();
        let context = WindowContext::new(module, window_id, self.outbox.clone());

        let handler = match factory.create(&context) {
            Ok(handler) => handler,
            Err(e) => {
                self.crashed.lock().insert(module.to_string());
                let this = Arc::clone(self);
                tokio::spawn(async move { this.terminate(&process_name).await });
                return Err(e);
            }
        };

        let window = Arc::new(GuestWindow {
            context,
            handler,
            process_name,
            flags: Mutex::new(WindowFlags::default()),
            cleaned_up: AtomicBool::new(false),
        });

        let mut windows = self.windows.lock();
        let list = windows.entry(module.to_string()).or_default();
        if let Some(stale) = list.iter().position(|existing| existing.id() == window_id) {
            warn!(module, %window_id, "Replacing window with a reused id");
            list.remove(stale);
        }
        list.push(Arc::clone(&window));
        Ok(window)
    }

    /// Runs one bound method under its timeout and reports the outcome.
    async fn supervise(
        self: Arc<Self>,
        window: Arc<GuestWindow>,
        bound: BoundMethod,
        invocation: Invocation,
        cancel: CancelFlag,
    ) {
        let method = invocation.method().to_string();
        let is_open = method == OPEN;
        let limit = bound.timeout.unwrap_or(self.default_timeout);

        if !is_open {
            window.emit(WindowEvent::Busy);
        }

        let run = bound.run;
        let worker = tokio::task::spawn_blocking(move || run(&invocation));

        match timeout(limit, worker).await {
            Ok(Ok(Ok(()))) => {
                debug!(module = %window.module(), window_id = %window.id(), %method, "Method done");
                if is_open {
                    window.emit(WindowEvent::Opened);
                }
                if method == CLOSE {
                    self.remove(&window);
                }
                window.emit(WindowEvent::Ready);
            }
            Ok(Ok(Err(e))) => {
                warn!(module = %window.module(), window_id = %window.id(), %method, error = %e, "Method failed");
                self.fail(&window, is_open).await;
            }
            Ok(Err(join)) => {
                error!(module = %window.module(), window_id = %window.id(), %method, error = %join, "Method panicked");
                self.fail(&window, is_open).await;
            }
            Err(_) => {
                cancel.cancel();
                warn!(
                    module = %window.module(),
                    window_id = %window.id(),
                    %method,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Method timed out"
                );
                self.cleanup_after_timeout(&window).await;
            }
        }
    }

    /// Reports a failed call; a failed `open` also tears the window down.
    async fn fail(&self, window: &Arc<GuestWindow>, is_open: bool) {
        if is_open {
            self.terminate(&window.process_name).await;
            self.remove(window);
            self.crashed.lock().insert(window.module().to_string());
        }
        window.flags.lock().is_busy = false;
        window.emit(WindowEvent::Error);
    }

    /// Cleans up around a call that overran its bound.
    ///
    /// Terminates the module's process, drops every window of the module,
    /// marks the window timed out and sends `error`. Returns `false` if the
    /// window was already cleaned up.
    async fn cleanup_after_timeout(&self, window: &Arc<GuestWindow>) -> bool {
        if window.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.terminate(&window.process_name).await;
        let dropped = self
            .windows
            .lock()
            .remove(window.module())
            .map_or(0, |list| list.len());
        *window.flags.lock() = WindowFlags::TIMED_OUT;

        info!(module = %window.module(), window_id = %window.id(), dropped, "Timeout cleanup done");
        self.send_error(window.module(), window.id());
        true
    }

    async fn terminate(&self, process_name: &str) {
        if let Err(e) = self.terminator.terminate(process_name).await {
            debug!(process_name, error = %e, "Process termination failed");
        }
    }

    fn find(&self, module: &str, window_id: WindowId) -> Option<Arc<GuestWindow>> {
        self.windows
            .lock()
            .get(module)?
            .iter()
            .find(|window| window.id() == window_id)
            .cloned()
    }

    fn remove(&self, window: &Arc<GuestWindow>) {
        let mut windows = self.windows.lock();
        if let Some(list) = windows.get_mut(window.module()) {
            list.retain(|existing| !Arc::ptr_eq(existing, window));
            if list.is_empty() {
                windows.remove(window.module());
            }
        }
    }

    fn send_error(&self, module: &str, window_id: WindowId) {
        let event = crate::protocol::HostEvent::window(module, window_id, WindowEvent::Error);
        if let Err(e) = self.outbox.send(event.to_payload()) {
            debug!(module, %window_id, error = %e, "Error event not sent");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
