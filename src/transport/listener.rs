//! TCP listener matching incoming guest agents to their links.
//!
//! Every guest connects to the same port. The first frame on a new
//! connection must be the `register` handshake; its MAC address selects the
//! [`GuestLink`] the stream is handed to. Until then frames are capped at
//! [`ListenerConfig::max_handshake_len`]; afterwards the link's own
//! `max_frame_len` applies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            GuestListener                 │
//! │            (single port)                 │
//! │  ┌────────────────────────────────────┐  │
//! │  │ 52:54:00:aa:bb:01 → GuestLink A    │  │
//! │  │ 52:54:00:aa:bb:02 → GuestLink B    │  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::link::GuestLink;
use crate::protocol::{FrameDecoder, HostEvent};

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes requested per read during the handshake.
const HANDSHAKE_CHUNK_SIZE: usize = 4096;

// ============================================================================
// GuestListener
// ============================================================================

/// Accepts guest agents and attaches them to registered links.
///
/// # Example
///
/// ```ignore
/// let listener = GuestListener::bind(ListenerConfig::default()).await?;
/// listener.register_guest(link.clone());
/// link.wait_until_connected(Duration::from_secs(300)).await?;
/// ```
pub struct GuestListener {
    /// Actual bound address.
    local_addr: SocketAddr,

    /// Settings.
    config: ListenerConfig,

    /// Registered links by lowercase MAC.
    links: RwLock<FxHashMap<String, GuestLink>>,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl GuestListener {
    /// Binds the listener and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(config: ListenerConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let this = Arc::new(Self {
            local_addr,
            config,
            links: RwLock::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let accept = Arc::clone(&this);
        tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });

        info!(%local_addr, "Guest listener started");
        Ok(this)
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered MAC addresses.
    #[inline]
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.links.read().len()
    }

    /// Makes a link reachable under each of its MAC addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the link has no MAC address.
    pub fn register_guest(&self, link: GuestLink) -> Result<()> {
        if link.macs().is_empty() {
            return Err(Error::config(format!(
                "guest {} has no MAC address to register with",
                link.name()
            )));
        }

        let mut links = self.links.write();
        for mac in link.macs() {
            if links.insert(mac.clone(), link.clone()).is_some() {
                warn!(%mac, guest = %link.name(), "MAC address re-registered");
            }
        }
        debug!(guest = %link.name(), "Guest registered with listener");
        Ok(())
    }

    /// Removes a link; returns `true` if any of its MACs was registered.
    pub fn unregister_guest(&self, link: &GuestLink) -> bool {
        let mut links = self.links.write();
        link.macs()
            .iter()
            .fold(false, |removed, mac| links.remove(mac).is_some() || removed)
    }

    /// Looks up the link registered for `mac`.
    #[must_use]
    pub fn guest(&self, mac: &str) -> Option<GuestLink> {
        self.links.read().get(&mac.to_ascii_lowercase()).cloned()
    }

    /// Stops accepting and disconnects every registered link.
    pub fn shutdown(&self) {
        info!("Guest listener shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        let links: Vec<GuestLink> = self.links.write().drain().map(|(_, link)| link).collect();
        for link in links {
            if link.is_connected() {
                link.disconnect();
            }
        }
    }

    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with timeout to allow checking the shutdown flag
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, addr).await {
                            warn!(error = %e, %addr, "Guest handshake failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Reads the handshake and hands the stream to its link.
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(%addr, "New TCP connection");

        let mut decoder = FrameDecoder::new(self.config.max_handshake_len);
        let limit = self.config.handshake_timeout;
        let first = timeout(limit, read_first_frame(&mut stream, &mut decoder))
            .await
            .map_err(|_| {
                Error::connection_timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
            })??;

        let network = match HostEvent::parse(&first)? {
            HostEvent::Register(network) => network,
            _ => return Err(Error::connection("first frame was not a register handshake")),
        };

        let link = self
            .guest(&network.mac)
            .ok_or_else(|| Error::guest_not_found(&network.mac))?;

        info!(guest = %link.name(), mac = %network.mac, %addr, "Guest registered");
        link.attach_with(stream, decoder, Vec::new(), Some(network));
        Ok(())
    }
}

/// Reads until one complete frame is buffered; later bytes stay in `decoder`.
async fn read_first_frame<S>(stream: &mut S, decoder: &mut FrameDecoder) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; HANDSHAKE_CHUNK_SIZE];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        decoder.feed(&chunk[..n]);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;

    use crate::config::LinkConfig;
    use crate::protocol::NetworkInfo;
    use crate::protocol::frame;
    use crate::testing::{TEST_TIMEOUT, init_tracing};

    fn local_config() -> ListenerConfig {
        ListenerConfig::new()
            .with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_handshake_timeout(Duration::from_millis(500))
    }

    fn register_frame(mac: &str) -> Vec<u8> {
        let info = NetworkInfo {
            ip_internet: "10.0.2.15".into(),
            ip_local: "192.168.56.101".into(),
            mac: mac.into(),
            iface_internet: "eth0".into(),
            iface_local: "eth1".into(),
        };
        frame::encode(&HostEvent::Register(info).to_payload()).expect("encode")
    }

    #[tokio::test]
    async fn test_register_attaches_link() {
        init_tracing();
        let listener = GuestListener::bind(local_config()).await.expect("bind");
        let link = GuestLink::builder("win10")
            .mac("52:54:00:AA:BB:01")
            .build()
            .expect("build");
        listener.register_guest(link.clone()).expect("register");

        let mut guest = TcpStream::connect(listener.local_addr()).await.expect("connect");
        // handshake and a following event in one write
        let mut wire = register_frame("52:54:00:AA:BB:01");
        wire.extend(frame::encode(b"time 2026-10-18 10:00:00").expect("encode"));
        guest.write_all(&wire).await.expect("write");

        link.wait_until_connected(TEST_TIMEOUT).await.expect("connected");
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while link.metadata().date.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "event not delivered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let metadata = link.metadata();
        assert_eq!(metadata.network.expect("network").ip_local, "192.168.56.101");
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_link_frame_limit_applies_after_handshake() {
        init_tracing();
        let listener = GuestListener::bind(local_config()).await.expect("bind");
        let link = GuestLink::builder("win10")
            .mac("52:54:00:aa:bb:03")
            .config(LinkConfig::new().with_max_frame_len(64))
            .build()
            .expect("build");
        listener.register_guest(link.clone()).expect("register");

        let mut guest = TcpStream::connect(listener.local_addr()).await.expect("connect");
        guest
            .write_all(&register_frame("52:54:00:aa:bb:03"))
            .await
            .expect("write");
        link.wait_until_connected(TEST_TIMEOUT).await.expect("connected");

        let zone = "Z".repeat(500);
        let oversized = frame::encode(&HostEvent::Timezone(zone).to_payload()).expect("encode");
        guest.write_all(&oversized).await.expect("write");

        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while link.is_connected() {
            assert!(tokio::time::Instant::now() < deadline, "oversized frame accepted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(link.metadata().timezone.is_none());
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_handshake_is_dropped() {
        let listener = GuestListener::bind(local_config().with_max_handshake_len(256))
            .await
            .expect("bind");
        let link = GuestLink::builder("win10")
            .mac("52:54:00:aa:bb:04")
            .build()
            .expect("build");
        listener.register_guest(link.clone()).expect("register");

        let mut guest = TcpStream::connect(listener.local_addr()).await.expect("connect");
        guest.write_all(b"ffffffff").await.expect("write");

        // the listener closes the socket instead of buffering the payload
        let mut byte = [0u8; 1];
        let read = timeout(TEST_TIMEOUT, guest.read(&mut byte))
            .await
            .expect("closed before timeout");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(!link.is_connected());
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_mac_is_rejected() {
        let listener = GuestListener::bind(local_config()).await.expect("bind");
        let link = GuestLink::builder("win10")
            .mac("52:54:00:aa:bb:01")
            .build()
            .expect("build");
        listener.register_guest(link.clone()).expect("register");

        let mut guest = TcpStream::connect(listener.local_addr()).await.expect("connect");
        guest
            .write_all(&register_frame("52:54:00:ff:ff:ff"))
            .await
            .expect("write");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!link.is_connected());
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_register_requires_mac() {
        let listener = GuestListener::bind(local_config()).await.expect("bind");
        let link = GuestLink::builder("nomac").build().expect("build");
        assert!(listener.register_guest(link).is_err());
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_guest_lookup_case_insensitive() {
        let listener = GuestListener::bind(local_config()).await.expect("bind");
        let link = GuestLink::builder("win10")
            .mac("52:54:00:aa:bb:01")
            .mac("52:54:00:aa:bb:02")
            .build()
            .expect("build");
        listener.register_guest(link.clone()).expect("register");

        assert_eq!(listener.registered_count(), 2);
        assert!(listener.guest("52:54:00:AA:BB:02").is_some());
        assert!(listener.unregister_guest(&link));
        assert!(listener.guest("52:54:00:aa:bb:01").is_none());
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_read_first_frame_keeps_remainder() {
        let mut wire = frame::encode(b"first").expect("encode");
        wire.extend(frame::encode(b"second").expect("encode"));
        let mut stream = tokio_test::io::Builder::new().read(&wire).build();

        let mut decoder = FrameDecoder::default();
        let first = read_first_frame(&mut stream, &mut decoder).await.expect("frame");
        assert_eq!(first, b"first");
        assert_eq!(decoder.next_frame().expect("frame"), Some(b"second".to_vec()));
    }
}
