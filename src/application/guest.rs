//! Guest-side method tables and invocation context.
//!
//! A guest module is a plain type `H` plus a [`MethodTable<H>`] naming the
//! methods the host may call, each with an optional timeout. The table is
//! built once; the dispatcher never looks methods up by reflection.
//!
//! # Example
//!
//! ```ignore
//! struct FileManagement;
//!
//! impl FileManagement {
//!     fn recycle(&self, inv: &Invocation) -> Result<()> {
//!         let path = inv.args().str_at(0)?;
//!         move_to_trash(path)
//!     }
//! }
//!
//! let factory = GuestFactory::new(
//!     |_cx| Ok(FileManagement),
//!     MethodTable::new()
//!         .method("open", |_, _| Ok(()))
//!         .method_with_timeout("recycle", Duration::from_secs(50), FileManagement::recycle),
//! )
//! .with_process_name("explorer.exe");
//! ```
//!
//! Handlers run on a blocking worker. A handler that may run long should poll
//! [`Invocation::is_cancelled`] and return once its bound has expired; the
//! dispatcher's cleanup does not wait for it either way.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::identifiers::WindowId;
use crate::protocol::{CommandArgs, HostEvent, WindowEvent};
use crate::transport::Outbox;

// ============================================================================
// CancelFlag
// ============================================================================

/// Cooperative cancellation signal handed to every invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag that is not raised.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the flag is raised.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// WindowContext
// ============================================================================

/// Identity of a guest-side window and its way back to the host.
#[derive(Clone)]
pub struct WindowContext {
    module: Arc<str>,
    window_id: WindowId,
    outbox: Outbox,
}

impl WindowContext {
    pub(crate) fn new(module: &str, window_id: WindowId, outbox: Outbox) -> Self {
        Self {
            module: Arc::from(module),
            window_id,
            outbox,
        }
    }

    /// Returns the module name.
    #[inline]
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Returns the window id.
    #[inline]
    #[must_use]
    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    /// Sends a raw payload to the host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.outbox.send(payload)
    }

    /// Sends a window event for this window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn send_event(&self, event: WindowEvent) -> Result<()> {
        self.send(HostEvent::window(self.module(), self.window_id, event).to_payload())
    }
}

impl fmt::Debug for WindowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowContext")
            .field("module", &self.module)
            .field("window_id", &self.window_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// Everything a method handler receives for one call.
#[derive(Debug)]
pub struct Invocation {
    context: WindowContext,
    method: String,
    args: CommandArgs,
    cancel: CancelFlag,
}

impl Invocation {
    pub(crate) fn new(
        context: WindowContext,
        method: impl Into<String>,
        args: CommandArgs,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            context,
            method: method.into(),
            args,
            cancel,
        }
    }

    /// Returns the window context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &WindowContext {
        &self.context
    }

    /// Returns the called method name.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the decoded arguments.
    #[inline]
    #[must_use]
    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    /// Returns `true` once the call's bound has expired.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends a raw payload to the host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.context.send(payload)
    }
}

// ============================================================================
// MethodTable
// ============================================================================

/// Signature of a guest method.
pub type MethodFn<H> = fn(&H, &Invocation) -> Result<()>;

/// One table entry.
struct MethodSpec<H> {
    timeout: Option<Duration>,
    call: MethodFn<H>,
}

impl<H> Clone for MethodSpec<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for MethodSpec<H> {}

/// Name → method table of one guest module.
pub struct MethodTable<H> {
    methods: FxHashMap<&'static str, MethodSpec<H>>,
}

impl<H> Default for MethodTable<H> {
    fn default() -> Self {
        Self {
            methods: FxHashMap::default(),
        }
    }
}

impl<H> MethodTable<H> {
    /// Creates an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method bounded by the agent's default method timeout.
    #[must_use]
    pub fn method(mut self, name: &'static str, call: MethodFn<H>) -> Self {
        self.methods.insert(name, MethodSpec { timeout: None, call });
        self
    }

    /// Adds a method with its own timeout.
    #[must_use]
    pub fn method_with_timeout(
        mut self,
        name: &'static str,
        timeout: Duration,
        call: MethodFn<H>,
    ) -> Self {
        self.methods.insert(
            name,
            MethodSpec {
                timeout: Some(timeout),
                call,
            },
        );
        self
    }

    /// Returns `true` if the table has `name`.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Number of methods.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if the table is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

// ============================================================================
// Type Erasure
// ============================================================================

/// A method resolved against one handler instance, ready to run.
pub(crate) struct BoundMethod {
    /// The method's own bound, if it declared one.
    pub(crate) timeout: Option<Duration>,
    /// Runs the method.
    pub(crate) run: Box<dyn FnOnce(&Invocation) -> Result<()> + Send>,
}

/// Handler instance with its method table, type erased.
pub(crate) trait BoundHandler: Send + Sync {
    /// Resolves `method`, or `None` if the table lacks it.
    fn bind(&self, method: &str) -> Option<BoundMethod>;
}

struct TypedHandler<H> {
    handler: Arc<H>,
    table: Arc<MethodTable<H>>,
}

impl<H: Send + Sync + 'static> BoundHandler for TypedHandler<H> {
    fn bind(&self, method: &str) -> Option<BoundMethod> {
        let spec = *self.table.methods.get(method)?;
        let handler = Arc::clone(&self.handler);
        Some(BoundMethod {
            timeout: spec.timeout,
            run: Box::new(move |invocation: &Invocation| (spec.call)(&handler, invocation)),
        })
    }
}

// ============================================================================
// GuestFactory
// ============================================================================

type GuestConstructor = dyn Fn(&WindowContext) -> Result<Arc<dyn BoundHandler>> + Send + Sync;

/// Creates the guest half of a module when the host opens a window.
#[derive(Clone)]
pub struct GuestFactory {
    create: Arc<GuestConstructor>,
    process_name: Option<String>,
}

impl GuestFactory {
    /// Builds a factory from a constructor and the module's method table.
    ///
    /// The constructor runs on the receive loop when `open` arrives, so it
    /// should only set up state; slow start-up belongs in the `open` method.
    pub fn new<H, F>(constructor: F, methods: MethodTable<H>) -> Self
    where
        H: Send + Sync + 'static,
        F: Fn(&WindowContext) -> Result<H> + Send + Sync + 'static,
    {
        let table = Arc::new(methods);
        Self {
            create: Arc::new(move |context: &WindowContext| {
                let handler = constructor(context)?;
                Ok(Arc::new(TypedHandler {
                    handler: Arc::new(handler),
                    table: Arc::clone(&table),
                }) as Arc<dyn BoundHandler>)
            }),
            process_name: None,
        }
    }

    /// Names the external process terminated when a call times out or
    /// opening fails; defaults to the module name.
    #[must_use]
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    /// Returns the configured process name.
    #[inline]
    #[must_use]
    pub fn process_name(&self) -> Option<&str> {
        self.process_name.as_deref()
    }

    pub(crate) fn create(&self, context: &WindowContext) -> Result<Arc<dyn BoundHandler>> {
        (self.create)(context)
    }
}

impl fmt::Debug for GuestFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestFactory")
            .field("process_name", &self.process_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
