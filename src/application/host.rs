//! Host-side handler contract.
//!
//! The host half of a module is a thin remote control: it turns typed calls
//! into `application` commands through its [`WindowChannel`] and may observe
//! the events the guest sends back. It never executes anything itself.
//!
//! # Example
//!
//! ```ignore
//! struct FileManagementHost {
//!     channel: WindowChannel,
//! }
//!
//! impl FileManagementHost {
//!     fn recycle(&self, path: &str) -> Result<()> {
//!         self.channel.invoke("recycle", &[path])
//!     }
//! }
//!
//! impl HostApplication for FileManagementHost {}
//!
//! let factory = HostFactory::new(|channel, _args| Ok(FileManagementHost { channel }));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::identifiers::WindowId;
use crate::protocol::{ApplicationCall, CommandArgs, GuestCommand, WindowEvent};
use crate::transport::Outbox;

use super::WindowFlags;

// ============================================================================
// HostApplication
// ============================================================================

/// Host half of an application module.
///
/// Concrete types are reachable again through
/// [`ApplicationWindow::handler_as`](crate::ApplicationWindow::handler_as).
pub trait HostApplication: Any + Send + Sync {
    /// Called on the receive loop after an event updated the window flags.
    fn on_event(&self, event: WindowEvent, flags: &WindowFlags) {
        let _ = (event, flags);
    }
}

/// Host half for modules that need no typed API.
struct GenericHost;

impl HostApplication for GenericHost {}

// ============================================================================
// HostFactory
// ============================================================================

type HostConstructor =
    dyn Fn(WindowChannel, &CommandArgs) -> Result<Box<dyn HostApplication>> + Send + Sync;

/// Creates the host half of a module for a freshly allocated window.
#[derive(Clone)]
pub struct HostFactory {
    create: Arc<HostConstructor>,
}

impl HostFactory {
    /// Wraps a constructor receiving the window's channel and open arguments.
    pub fn new<A, F>(constructor: F) -> Self
    where
        A: HostApplication,
        F: Fn(WindowChannel, &CommandArgs) -> Result<A> + Send + Sync + 'static,
    {
        Self {
            create: Arc::new(move |channel: WindowChannel, args: &CommandArgs| {
                constructor(channel, args).map(|app| Box::new(app) as Box<dyn HostApplication>)
            }),
        }
    }

    /// Factory for modules driven only through [`WindowChannel::invoke`].
    #[must_use]
    pub fn generic() -> Self {
        Self::new(|_, _| Ok(GenericHost))
    }

    pub(crate) fn create(
        &self,
        channel: WindowChannel,
        args: &CommandArgs,
    ) -> Result<Box<dyn HostApplication>> {
        (self.create)(channel, args)
    }
}

impl fmt::Debug for HostFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFactory").finish_non_exhaustive()
    }
}

// ============================================================================
// WindowChannel
// ============================================================================

/// Sending side of one application window.
///
/// Cheap to clone; clones share the window's flags.
#[derive(Clone)]
pub struct WindowChannel {
    module: Arc<str>,
    window_id: WindowId,
    outbox: Outbox,
    flags: Arc<Mutex<WindowFlags>>,
}

impl WindowChannel {
    pub(crate) fn new(module: &str, window_id: WindowId, outbox: Outbox) -> Self {
        Self {
            module: Arc::from(module),
            window_id,
            outbox,
            flags: Arc::new(Mutex::new(WindowFlags::default())),
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

    /// Returns a snapshot of the window flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> WindowFlags {
        *self.flags.lock()
    }

    /// Calls a guest method and marks the window busy.
    ///
    /// Returns once the command is queued; poll
    /// [`flags`](Self::flags) for `is_busy`/`has_error` afterwards.
    ///
    /// # Arguments
    ///
    /// * `method` - Name in the module's guest method table
    /// * `args` - Positional arguments, base64-encoded on the wire
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn invoke<A: AsRef<[u8]>>(&self, method: &str, args: &[A]) -> Result<()> {
        self.flags.lock().is_busy = true;
        self.send_call(method, CommandArgs::new(args.iter().map(|arg| arg.as_ref().to_vec())))
    }

    /// Sends a method call without touching the flags.
    pub(crate) fn send_call(&self, method: &str, args: CommandArgs) -> Result<()> {
        debug!(module = %self.module, window_id = %self.window_id, method, "Calling guest method");
        let command = GuestCommand::Application(ApplicationCall {
            module: self.module.to_string(),
            window_id: self.window_id,
            method: method.to_string(),
            args,
        });
        self.outbox.send(command.to_payload())
    }

    /// Applies an inbound event and returns the new flags.
    pub(crate) fn apply(&self, event: WindowEvent) -> WindowFlags {
        let mut flags = self.flags.lock();
        flags.apply(event);
        *flags
    }
}

impl fmt::Debug for WindowChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowChannel")
            .field("module", &self.module)
            .field("window_id", &self.window_id)
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::LinkConfig;
    use crate::error::Error;
    use crate::protocol::args::encode_field;
    use crate::testing::{FramePeer, RecordingHandler};
    use crate::transport::Connection;

    #[tokio::test]
    async fn test_invoke_marks_busy_and_encodes_args() {
        let (local, remote) = tokio::io::duplex(4096);
        let outbox = Outbox::new();
        outbox.replace(Connection::spawn(
            local,
            RecordingHandler::new(),
            &LinkConfig::default(),
        ));
        let mut peer = FramePeer::new(remote);

        let channel = WindowChannel::new("fileManagement", WindowId::new(7), outbox);
        channel.invoke("recycle", &["C:\\Users\\bob\\a file.txt"]).expect("invoke");

        assert!(channel.flags().is_busy);
        let expected = format!(
            "application fileManagement 7 recycle {}",
            encode_field("C:\\Users\\bob\\a file.txt")
        );
        assert_eq!(peer.recv().await, expected.as_bytes());
    }

    #[test]
    fn test_invoke_on_closed_link() {
        let channel = WindowChannel::new("webBrowser", WindowId::new(1), Outbox::new());
        let err = channel.invoke::<&str>("browse", &[]).expect_err("closed");
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_generic_factory() {
        let factory = HostFactory::generic();
        let channel = WindowChannel::new("webBrowser", WindowId::new(1), Outbox::new());
        assert!(factory.create(channel, &CommandArgs::default()).is_ok());
    }
}
