//! Framed byte-stream connection and its receive loop.
//!
//! This module owns one socket (or any `AsyncRead + AsyncWrite` stream) and
//! turns it into an ordered sequence of frame payloads.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - Reads into the reassembly buffer, handing every complete frame to the
//!   [`FrameHandler`] synchronously and in order before the next read
//! - Outgoing payloads queued by [`Connection::send`] (never blocks the caller)
//! - Shutdown requests
//!
//! # Disconnect Handling
//!
//! | Condition | Reason | Logged at |
//! |-----------|--------|-----------|
//! | zero-length read | [`DisconnectReason::PeerClosed`] | debug |
//! | reset / aborted / broken pipe | [`DisconnectReason::Reset`] | warn |
//! | corrupt length header | [`DisconnectReason::Protocol`] | error |
//! | any other I/O error | [`DisconnectReason::Io`] | error |
//! | [`Connection::shutdown`] or last handle dropped | [`DisconnectReason::Shutdown`] | debug |
//!
//! In every case the state becomes [`LinkState::Disconnected`] before the
//! handler's `on_disconnect` runs, and nothing propagates to callers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::protocol::frame::{self, FrameDecoder};

// ============================================================================
// LinkState
// ============================================================================

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// No live socket.
    #[default]
    Disconnected,
    /// Socket accepted and receive loop running.
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

// ============================================================================
// DisconnectReason
// ============================================================================

/// Why a receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    PeerClosed,
    /// The stream was reset or the pipe broke.
    Reset,
    /// The byte stream could not be framed.
    Protocol(String),
    /// Any other I/O failure.
    Io(String),
    /// Local shutdown.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Reset => f.write_str("connection reset"),
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
            Self::Io(message) => write!(f, "I/O error: {message}"),
            Self::Shutdown => f.write_str("local shutdown"),
        }
    }
}

// ============================================================================
// FrameHandler
// ============================================================================

/// Consumer of decoded frames.
///
/// `on_frame` runs on the receive loop; it must hand long work off to its own
/// task instead of blocking the next read.
pub trait FrameHandler: Send + Sync + 'static {
    /// Called once per frame, in arrival order.
    fn on_frame(&self, payload: Vec<u8>);

    /// Called once when the loop ends, after the state became `Disconnected`.
    fn on_disconnect(&self, reason: &DisconnectReason) {
        let _ = reason;
    }
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write an already framed payload.
    Send(Vec<u8>),
    /// Close the write side and stop.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// One framed stream with its receive loop.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and cheap to clone. All operations are
/// non-blocking.
#[derive(Clone)]
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// State shared with the event loop.
    state: Arc<Mutex<LinkState>>,
}

impl Connection {
    /// Starts the receive loop on `stream`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(stream: S, handler: Arc<dyn FrameHandler>, config: &LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with(
            stream,
            FrameDecoder::new(config.max_frame_len),
            Vec::new(),
            handler,
            config.read_chunk_size,
        )
    }

    /// Starts the receive loop with bytes and frames read before the handoff.
    ///
    /// `pending` frames are delivered first, then whatever `decoder` still
    /// buffers, then new reads.
    pub(crate) fn spawn_with<S>(
        stream: S,
        decoder: FrameDecoder,
        pending: Vec<Vec<u8>>,
        handler: Arc<dyn FrameHandler>,
        read_chunk_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(LinkState::Connected));

        tokio::spawn(Self::run_event_loop(
            stream,
            decoder,
            pending,
            command_rx,
            Arc::clone(&state),
            handler,
            read_chunk_size.max(1),
        ));

        Self { command_tx, state }
    }

    /// Frames a payload and queues it for sending.
    ///
    /// # Errors
    ///
    /// - [`Error::FrameTooLarge`] if the payload does not fit a header
    /// - [`Error::ConnectionClosed`] if the loop has ended
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let frame = frame::encode(&payload)?;
        self.command_tx
            .send(ConnectionCommand::Send(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Returns `true` while the receive loop runs.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Closes the connection.
    ///
    /// Payloads queued before the call are still written.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that handles stream I/O.
    async fn run_event_loop<S>(
        stream: S,
        mut decoder: FrameDecoder,
        pending: Vec<Vec<u8>>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        state: Arc<Mutex<LinkState>>,
        handler: Arc<dyn FrameHandler>,
        read_chunk_size: usize,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut chunk = vec![0u8; read_chunk_size];

        for payload in pending {
            handler.on_frame(payload);
        }

        let reason = match Self::drain_frames(&mut decoder, handler.as_ref()) {
            Ok(()) => loop {
                tokio::select! {
                    // Incoming bytes from the peer
                    read = reader.read(&mut chunk) => {
                        match read {
                            Ok(0) => break DisconnectReason::PeerClosed,
                            Ok(n) => {
                                decoder.feed(&chunk[..n]);
                                if let Err(e) = Self::drain_frames(&mut decoder, handler.as_ref()) {
                                    break DisconnectReason::Protocol(e.to_string());
                                }
                            }
                            Err(e) if is_reset(&e) => break DisconnectReason::Reset,
                            Err(e) => break DisconnectReason::Io(e.to_string()),
                        }
                    }

                    // Outgoing payloads from the API
                    command = command_rx.recv() => {
                        match command {
                            Some(ConnectionCommand::Send(frame)) => {
                                if let Err(reason) = Self::write_frame(&mut writer, &frame).await {
                                    break reason;
                                }
                            }
                            Some(ConnectionCommand::Shutdown) | None => {
                                Self::flush_queued(&mut writer, &mut command_rx).await;
                                let _ = writer.shutdown().await;
                                break DisconnectReason::Shutdown;
                            }
                        }
                    }
                }
            },
            Err(e) => DisconnectReason::Protocol(e.to_string()),
        };

        *state.lock() = LinkState::Disconnected;

        match &reason {
            DisconnectReason::PeerClosed | DisconnectReason::Shutdown => {
                debug!(%reason, "Receive loop ended");
            }
            DisconnectReason::Reset => warn!(%reason, "Receive loop ended"),
            DisconnectReason::Protocol(_) | DisconnectReason::Io(_) => {
                error!(%reason, "Receive loop failed");
            }
        }

        handler.on_disconnect(&reason);
    }

    /// Hands every complete buffered frame to the handler.
    fn drain_frames(decoder: &mut FrameDecoder, handler: &dyn FrameHandler) -> Result<()> {
        while let Some(payload) = decoder.next_frame()? {
            trace!(len = payload.len(), "Frame received");
            handler.on_frame(payload);
        }
        Ok(())
    }

    /// Writes one frame.
    async fn write_frame<S>(
        writer: &mut WriteHalf<S>,
        frame: &[u8],
    ) -> std::result::Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite,
    {
        let written = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                trace!(len = frame.len() - frame::HEADER_LEN, "Frame sent");
                Ok(())
            }
            Err(e) if is_reset(&e) => Err(DisconnectReason::Reset),
            Err(e) => Err(DisconnectReason::Io(e.to_string())),
        }
    }

    /// Writes payloads that were queued before the shutdown request.
    async fn flush_queued<S>(
        writer: &mut WriteHalf<S>,
        command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    ) where
        S: AsyncRead + AsyncWrite,
    {
        while let Ok(ConnectionCommand::Send(frame)) = command_rx.try_recv() {
            if Self::write_frame(writer, &frame).await.is_err() {
                break;
            }
        }
    }
}

/// Returns `true` for errors meaning the peer went away.
fn is_reset(err: &IoError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

// ============================================================================
// Outbox
// ============================================================================

/// Handle to whichever connection a link currently uses.
///
/// Windows and ShellExec handles keep an `Outbox` instead of a
/// [`Connection`], so they keep working after the guest reconnects.
#[derive(Clone, Default)]
pub struct Outbox {
    current: Arc<Mutex<Option<Connection>>>,
}

impl Outbox {
    /// Creates an outbox with no connection.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a connection, shutting down the previous one.
    pub(crate) fn replace(&self, connection: Connection) {
        if let Some(previous) = self.current.lock().replace(connection) {
            previous.shutdown();
        }
    }

    /// Removes and shuts down the current connection.
    pub(crate) fn close(&self) {
        if let Some(connection) = self.current.lock().take() {
            connection.shutdown();
        }
    }

    /// Queues a payload on the current connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if there is no live connection.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        match self.current.lock().as_ref() {
            Some(connection) => connection.send(payload.into()),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Returns the state of the current connection.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.current
            .lock()
            .as_ref()
            .map_or(LinkState::Disconnected, Connection::state)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    use crate::testing::{FramePeer, RecordingHandler};

    #[tokio::test]
    async fn test_reassembles_split_frames_in_order() {
        let first = frame::encode(b"application fileManagement 1 opened").expect("encode");
        let second = frame::encode(b"application fileManagement 1 ready").expect("encode");
        let wire = [first, second].concat();

        // mid-header, mid-payload
        let mock = tokio_test::io::Builder::new()
            .read(&wire[..4])
            .read(&wire[4..30])
            .read(&wire[30..])
            .build();

        let handler = RecordingHandler::new();
        let connection = Connection::spawn(mock, handler.clone(), &LinkConfig::default());

        handler.wait_disconnect().await;
        assert_eq!(
            handler.frames(),
            vec![
                b"application fileManagement 1 opened".to_vec(),
                b"application fileManagement 1 ready".to_vec(),
            ]
        );
        assert_eq!(handler.disconnect_reason(), Some(DisconnectReason::PeerClosed));
        assert_eq!(connection.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_without_error() {
        let (local, remote) = tokio::io::duplex(1024);
        let handler = RecordingHandler::new();
        let connection = Connection::spawn(local, handler.clone(), &LinkConfig::default());
        assert!(connection.is_connected());

        drop(remote);
        handler.wait_disconnect().await;

        assert_eq!(connection.state(), LinkState::Disconnected);
        assert!(matches!(
            connection.send(b"guesttime".to_vec()),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reset_is_non_fatal() {
        let mock = tokio_test::io::Builder::new()
            .read_error(IoError::new(ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let handler = RecordingHandler::new();
        let connection = Connection::spawn(mock, handler.clone(), &LinkConfig::default());

        handler.wait_disconnect().await;
        assert_eq!(handler.disconnect_reason(), Some(DisconnectReason::Reset));
        assert_eq!(connection.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_other_io_error_leaves_link_disconnected() {
        let mock = tokio_test::io::Builder::new()
            .read_error(IoError::other("disk on fire"))
            .build();
        let handler = RecordingHandler::new();
        let connection = Connection::spawn(mock, handler.clone(), &LinkConfig::default());

        handler.wait_disconnect().await;
        assert!(matches!(handler.disconnect_reason(), Some(DisconnectReason::Io(_))));
        assert_eq!(connection.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_corrupt_header_tears_down() {
        let mock = tokio_test::io::Builder::new()
            .read(b"00000004infozzzzzzzzjunk")
            .build();
        let handler = RecordingHandler::new();
        let _connection = Connection::spawn(mock, handler.clone(), &LinkConfig::default());

        handler.wait_disconnect().await;
        assert_eq!(handler.frames(), vec![b"info".to_vec()]);
        assert!(matches!(
            handler.disconnect_reason(),
            Some(DisconnectReason::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_send_writes_frames() {
        let (local, remote) = tokio::io::duplex(1024);
        let handler = RecordingHandler::new();
        let connection = Connection::spawn(local, handler, &LinkConfig::default());
        let mut peer = FramePeer::new(remote);

        connection.send(b"guesttime".to_vec()).expect("send");
        connection.send(b"guesttzone".to_vec()).expect("send");

        assert_eq!(peer.recv().await, b"guesttime");
        assert_eq!(peer.recv().await, b"guesttzone");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let (local, remote) = tokio::io::duplex(1024);
        let handler = RecordingHandler::new();
        let connection = Connection::spawn(local, handler.clone(), &LinkConfig::default());
        let mut peer = FramePeer::new(remote);

        connection.send(b"initClean".to_vec()).expect("send");
        connection.shutdown();

        assert_eq!(peer.recv().await, b"initClean");
        handler.wait_disconnect().await;
        assert_eq!(handler.disconnect_reason(), Some(DisconnectReason::Shutdown));
    }

    #[tokio::test]
    async fn test_outbox_without_connection() {
        let outbox = Outbox::new();
        assert_eq!(outbox.state(), LinkState::Disconnected);
        assert!(matches!(outbox.send("guesttime"), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_outbox_replace_shuts_down_previous() {
        let (first_local, _first_remote) = tokio::io::duplex(1024);
        let (second_local, remote) = tokio::io::duplex(1024);
        let first_handler = RecordingHandler::new();

        let outbox = Outbox::new();
        outbox.replace(Connection::spawn(
            first_local,
            first_handler.clone(),
            &LinkConfig::default(),
        ));
        outbox.replace(Connection::spawn(
            second_local,
            RecordingHandler::new(),
            &LinkConfig::default(),
        ));

        timeout(Duration::from_secs(5), first_handler.wait_disconnect())
            .await
            .expect("first connection closed");

        let mut peer = FramePeer::new(remote);
        outbox.send("guesttzone").expect("send");
        assert_eq!(peer.recv().await, b"guesttzone");
        assert_eq!(outbox.state(), LinkState::Connected);
    }
}
