//! Shared helpers for unit tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::EnvFilter;

use crate::protocol::frame::{self, FrameDecoder};
use crate::transport::{DisconnectReason, FrameHandler};

/// Upper bound for anything a test waits on.
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RecordingHandler
// ============================================================================

/// Frame handler that records everything it sees.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    frames: Mutex<Vec<Vec<u8>>>,
    disconnect: Mutex<Option<DisconnectReason>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect.lock().clone()
    }

    pub(crate) async fn wait_disconnect(&self) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while self.disconnect.lock().is_none() {
            assert!(Instant::now() < deadline, "connection did not close");
            sleep(Duration::from_millis(5)).await;
        }
    }
}

impl FrameHandler for RecordingHandler {
    fn on_frame(&self, payload: Vec<u8>) {
        self.frames.lock().push(payload);
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        *self.disconnect.lock() = Some(reason.clone());
    }
}

// ============================================================================
// FramePeer
// ============================================================================

/// The far end of an in-memory link, speaking raw frames.
pub(crate) struct FramePeer {
    stream: DuplexStream,
    decoder: FrameDecoder,
}

impl FramePeer {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::default(),
        }
    }

    /// Writes one framed payload.
    pub(crate) async fn send(&mut self, payload: impl AsRef<[u8]>) {
        let frame = frame::encode(payload.as_ref()).expect("encode frame");
        self.stream.write_all(&frame).await.expect("write frame");
    }

    /// Reads the next payload, panicking after [`TEST_TIMEOUT`].
    pub(crate) async fn recv(&mut self) -> Vec<u8> {
        self.recv_within(TEST_TIMEOUT)
            .await
            .expect("no frame received in time")
    }

    /// Reads the next payload if one arrives within `limit`.
    pub(crate) async fn recv_within(&mut self, limit: Duration) -> Option<Vec<u8>> {
        timeout(limit, async {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(payload) = self.decoder.next_frame().expect("valid frame") {
                    return Some(payload);
                }
                let n = self.stream.read(&mut chunk).await.expect("read");
                if n == 0 {
                    return None;
                }
                self.decoder.feed(&chunk[..n]);
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Reads payloads until one satisfies `matches`, returning it.
    pub(crate) async fn recv_matching(&mut self, matches: impl Fn(&[u8]) -> bool) -> Vec<u8> {
        loop {
            let payload = self.recv().await;
            if matches(&payload) {
                return payload;
            }
        }
    }
}
