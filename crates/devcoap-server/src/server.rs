//! Inbound CoAP listener
//!
//! Binds the configured address on the CoAP port for the driver's security
//! mode and answers every request through the [`IngestHandler`]. The loop
//! runs until its cancellation token fires.

use bytes::Bytes;
use coap_lite::MessageType;
use devcoap_core::packet::{self, PacketExt};
use devcoap_core::SecurityMode;
use devcoap_transport::resolve_address;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServerError};
use crate::ingest::IngestHandler;

/// How long an answered request is remembered for duplicate detection
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Answers remembered per responder; the oldest is evicted beyond this
pub const MAX_CACHED_RESPONSES: usize = 1024;

const MAX_DATAGRAM: usize = 1152;

/// Listener configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Host or address to bind
    pub bind_addr: String,
    pub security_mode: SecurityMode,
    /// Decoded pre-shared key, required for PSK
    pub psk_key: Option<Vec<u8>>,
    /// Port override; the mode's default port when `None`
    pub port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            security_mode: SecurityMode::None,
            psk_key: None,
            port: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("security_mode", &self.security_mode)
            .field("psk_key_len", &self.psk_key.as_ref().map(|k| k.len()))
            .field("port", &self.port)
            .finish()
    }
}

enum Endpoint {
    Udp(Arc<UdpSocket>),
    #[cfg(feature = "dtls")]
    Dtls(devcoap_transport::DtlsListener),
}

/// A bound listener
pub struct CoapServer {
    endpoint: Endpoint,
    handler: Arc<IngestHandler>,
    local_addr: SocketAddr,
    mode: SecurityMode,
}

impl CoapServer {
    /// Bind the listen endpoint
    pub async fn bind(config: ServerConfig, handler: Arc<IngestHandler>) -> Result<Self> {
        let port = config
            .port
            .unwrap_or_else(|| config.security_mode.default_port());
        let addr = resolve_address(&config.bind_addr, port).await.map_err(|e| {
            error!("failed to resolve CoAP bind address");
            ServerError::Bind(e.to_string())
        })?;

        let (endpoint, local_addr) = match config.security_mode {
            SecurityMode::None => {
                let socket = UdpSocket::bind(addr).await.map_err(|e| {
                    error!("cannot initialize listen endpoint");
                    ServerError::Bind(e.to_string())
                })?;
                let local = socket.local_addr().map_err(|e| ServerError::Bind(e.to_string()))?;
                (Endpoint::Udp(Arc::new(socket)), local)
            }
            SecurityMode::PreSharedKey => bind_dtls(addr, config.psk_key.as_deref()).await?,
            SecurityMode::Unknown => {
                return Err(ServerError::Configuration(
                    "unknown security mode".to_string(),
                ))
            }
        };

        info!(
            "CoAP {} server started on {}",
            config.security_mode.label(),
            local_addr
        );
        Ok(Self {
            endpoint,
            handler,
            local_addr,
            mode: config.security_mode,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.mode
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        match self.endpoint {
            Endpoint::Udp(socket) => serve_udp(socket, self.handler, shutdown).await,
            #[cfg(feature = "dtls")]
            Endpoint::Dtls(listener) => serve_dtls(listener, self.handler, shutdown).await,
        }
    }
}

#[cfg(feature = "dtls")]
async fn bind_dtls(addr: SocketAddr, key: Option<&[u8]>) -> Result<(Endpoint, SocketAddr)> {
    let key = key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ServerError::Configuration("PSK key missing".to_string()))?;
    let listener = devcoap_transport::DtlsListener::bind(addr, b"", key)
        .await
        .map_err(|e| {
            error!("cannot initialize PSK");
            ServerError::Bind(e.to_string())
        })?;
    let local = listener.local_addr();
    Ok((Endpoint::Dtls(listener), local))
}

#[cfg(not(feature = "dtls"))]
async fn bind_dtls(_addr: SocketAddr, _key: Option<&[u8]>) -> Result<(Endpoint, SocketAddr)> {
    Err(ServerError::Configuration(
        "dtls support not compiled in".to_string(),
    ))
}

type CacheKey = (SocketAddr, u16);

/// Answers already sent, keyed by peer and message id.
///
/// `order` holds keys in insertion order, so expired entries are always at
/// its front. An order slot whose stamp no longer matches the map entry is
/// stale and skipped.
struct ResponseCache {
    entries: HashMap<CacheKey, (Instant, Bytes)>,
    order: VecDeque<(CacheKey, Instant)>,
    capacity: usize,
    lifetime: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_limits(MAX_CACHED_RESPONSES, EXCHANGE_LIFETIME)
    }
}

impl ResponseCache {
    fn with_limits(capacity: usize, lifetime: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            lifetime,
        }
    }

    fn get(&self, peer: SocketAddr, message_id: u16) -> Option<Bytes> {
        self.entries
            .get(&(peer, message_id))
            .filter(|(at, _)| at.elapsed() < self.lifetime)
            .map(|(_, wire)| wire.clone())
    }

    fn insert(&mut self, peer: SocketAddr, message_id: u16, wire: Bytes) {
        while let Some((_, at)) = self.order.front() {
            if at.elapsed() < self.lifetime {
                break;
            }
            self.pop_oldest();
        }
        while self.entries.len() >= self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }

        let at = Instant::now();
        self.entries.insert((peer, message_id), (at, wire));
        self.order.push_back(((peer, message_id), at));
    }

    /// Drop the oldest order slot and its entry if still current
    fn pop_oldest(&mut self) -> bool {
        let Some((key, at)) = self.order.pop_front() else {
            return false;
        };
        if self.entries.get(&key).is_some_and(|(current, _)| *current == at) {
            self.entries.remove(&key);
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-peer answering state
struct Responder {
    handler: Arc<IngestHandler>,
    cache: ResponseCache,
    next_message_id: u16,
}

impl Responder {
    fn new(handler: Arc<IngestHandler>) -> Self {
        Self {
            handler,
            cache: ResponseCache::default(),
            next_message_id: rand::random(),
        }
    }

    /// Wire bytes to send back for `data`, if any
    fn answer(&mut self, peer: SocketAddr, data: &[u8]) -> Option<Bytes> {
        let request = match packet::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable datagram from {}: {}", peer, e);
                return None;
            }
        };
        let mid = request.header.message_id;
        let confirmable = request.message_type() == MessageType::Confirmable;

        if request.is_empty_message() {
            // CoAP ping
            if confirmable {
                return packet::encode(&packet::reset(mid)).ok().map(Bytes::from);
            }
            return None;
        }
        if !request.is_request() {
            debug!("ignoring {:?} from {}", request.message_type(), peer);
            return None;
        }

        if confirmable {
            if let Some(wire) = self.cache.get(peer, mid) {
                debug!("duplicate mid={} from {}", mid, peer);
                return Some(wire);
            }
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let response = self.handler.respond(&request, message_id);
        match packet::encode(&response) {
            Ok(wire) => {
                let wire = Bytes::from(wire);
                if confirmable {
                    self.cache.insert(peer, mid, wire.clone());
                }
                Some(wire)
            }
            Err(e) => {
                error!("cannot encode response: {}", e);
                None
            }
        }
    }
}

async fn serve_udp(
    socket: Arc<UdpSocket>,
    handler: Arc<IngestHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut responder = Responder::new(handler);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, peer)) => {
                if let Some(wire) = responder.answer(peer, &buf[..len]) {
                    if let Err(e) = socket.send_to(&wire, peer).await {
                        warn!("cannot answer {}: {}", peer, e);
                    }
                }
            }
            Err(e) => error!("CoAP recv error: {}", e),
        }
    }

    info!("CoAP server stopped");
    Ok(())
}

#[cfg(feature = "dtls")]
async fn serve_dtls(
    listener: devcoap_transport::DtlsListener,
    handler: Arc<IngestHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    use devcoap_transport::DatagramChannel;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let channel = match accepted {
            Ok(channel) => channel,
            Err(e) => {
                warn!("DTLS accept failed: {}", e);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let peer = channel.peer_addr();
            let mut responder = Responder::new(handler);
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = channel.recv(&mut buf) => received,
                };
                match received {
                    Ok(len) => {
                        if let Some(wire) = responder.answer(peer, &buf[..len]) {
                            if let Err(e) = channel.send(&wire).await {
                                warn!("cannot answer {}: {}", peer, e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("DTLS session with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
            let _ = channel.close().await;
        });
    }

    if let Err(e) = listener.close().await {
        debug!("error closing DTLS listener: {}", e);
    }
    info!("CoAP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let mut cache = ResponseCache::with_limits(2, EXCHANGE_LIFETIME);
        cache.insert(peer(1), 1, Bytes::from_static(b"a"));
        cache.insert(peer(1), 2, Bytes::from_static(b"b"));
        cache.insert(peer(2), 1, Bytes::from_static(b"c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(peer(1), 1).is_none());
        assert_eq!(cache.get(peer(1), 2), Some(Bytes::from_static(b"b")));
        assert_eq!(cache.get(peer(2), 1), Some(Bytes::from_static(b"c")));
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let mut cache = ResponseCache::with_limits(16, EXCHANGE_LIFETIME);
        for mid in 0..1000u16 {
            cache.insert(peer(mid % 7), mid, Bytes::from_static(b"x"));
            assert!(cache.len() <= 16);
        }
        assert!(cache.order.len() <= 16);
        assert!(cache.get(peer(999 % 7), 999).is_some());
    }

    #[test]
    fn test_cache_drops_expired_on_insert() {
        let mut cache = ResponseCache::with_limits(8, Duration::from_millis(20));
        cache.insert(peer(1), 1, Bytes::from_static(b"a"));
        cache.insert(peer(1), 2, Bytes::from_static(b"b"));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get(peer(1), 1).is_none());
        cache.insert(peer(1), 3, Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.order.len(), 1);
    }

    #[test]
    fn test_cache_reinsert_keeps_newest() {
        let mut cache = ResponseCache::with_limits(2, EXCHANGE_LIFETIME);
        cache.insert(peer(1), 1, Bytes::from_static(b"old"));
        cache.insert(peer(1), 1, Bytes::from_static(b"new"));
        cache.insert(peer(1), 2, Bytes::from_static(b"b"));

        // the stale slot for mid 1 is skipped, not counted as an eviction
        assert_eq!(cache.get(peer(1), 1), Some(Bytes::from_static(b"new")));
        assert_eq!(cache.len(), 2);
    }
}
