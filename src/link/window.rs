//! Host-side application window handle.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::application::{HostApplication, WindowChannel, WindowFlags};
use crate::error::Result;
use crate::identifiers::WindowId;
use crate::protocol::{CommandArgs, WindowEvent};

// ============================================================================
// ApplicationWindow
// ============================================================================

/// One open application instance on a guest.
///
/// Cheap to clone; clones share flags and the host handler.
#[derive(Clone)]
pub struct ApplicationWindow {
    inner: Arc<WindowInner>,
}

struct WindowInner {
    channel: WindowChannel,
    handler: Box<dyn HostApplication>,
}

impl ApplicationWindow {
    pub(crate) fn new(channel: WindowChannel, handler: Box<dyn HostApplication>) -> Self {
        Self {
            inner: Arc::new(WindowInner { channel, handler }),
        }
    }

    /// Returns the module name.
    #[inline]
    #[must_use]
    pub fn module(&self) -> &str {
        self.inner.channel.module()
    }

    /// Returns the window id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WindowId {
        self.inner.channel.window_id()
    }

    /// Returns a snapshot of the flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> WindowFlags {
        self.inner.channel.flags()
    }

    /// Returns `true` once the guest reported `opened`.
    #[inline]
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.flags().is_opened
    }

    /// Returns `true` while a call is outstanding.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.flags().is_busy
    }

    /// Returns `true` once the guest reported `error`.
    #[inline]
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.flags().has_error
    }

    /// Returns the window's channel.
    #[inline]
    #[must_use]
    pub fn channel(&self) -> &WindowChannel {
        &self.inner.channel
    }

    /// Returns the host handler.
    #[inline]
    #[must_use]
    pub fn handler(&self) -> &dyn HostApplication {
        self.inner.handler.as_ref()
    }

    /// Returns the host handler as its concrete type.
    #[must_use]
    pub fn handler_as<T: HostApplication>(&self) -> Option<&T> {
        let handler: &dyn Any = self.inner.handler.as_ref();
        handler.downcast_ref::<T>()
    }

    /// Calls a guest method; see [`WindowChannel::invoke`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn invoke<A: AsRef<[u8]>>(&self, method: &str, args: &[A]) -> Result<()> {
        self.inner.channel.invoke(method, args)
    }

    /// Asks the guest to close the application.
    ///
    /// The window stays in the link's registry; remove it with
    /// [`GuestLink::remove_window`](crate::GuestLink::remove_window) when done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the link is down.
    pub fn close(&self) -> Result<()> {
        self.inner.channel.send_call("close", CommandArgs::default())
    }

    /// Applies an inbound event and notifies the handler.
    pub(crate) fn apply(&self, event: WindowEvent) {
        let flags = self.inner.channel.apply(event);
        debug!(
            module = %self.module(),
            window_id = %self.id(),
            %event,
            ?flags,
            "Window event"
        );
        self.inner.handler.on_event(event, &flags);
    }
}

impl fmt::Debug for ApplicationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationWindow")
            .field("module", &self.module())
            .field("id", &self.id())
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

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::Outbox;

    #[derive(Default)]
    struct CountingHost {
        events: AtomicUsize,
    }

    impl HostApplication for CountingHost {
        fn on_event(&self, _event: WindowEvent, _flags: &WindowFlags) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OtherHost;

    impl HostApplication for OtherHost {}

    fn window() -> ApplicationWindow {
        let channel = WindowChannel::new("mailClient", WindowId::new(2), Outbox::new());
        ApplicationWindow::new(channel, Box::new(CountingHost::default()))
    }

    #[test]
    fn test_apply_updates_flags_and_notifies() {
        let window = window();
        window.apply(WindowEvent::Opened);
        window.apply(WindowEvent::Busy);

        assert!(window.is_opened());
        assert!(window.is_busy());
        let host = window.handler_as::<CountingHost>().expect("concrete type");
        assert_eq!(host.events.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_as_wrong_type() {
        assert!(window().handler_as::<OtherHost>().is_none());
    }

    #[test]
    fn test_clones_share_flags() {
        let window = window();
        let clone = window.clone();
        window.apply(WindowEvent::Error);
        assert!(clone.has_error());
    }
}
