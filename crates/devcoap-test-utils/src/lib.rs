//! Common test helpers for device-coap tests
//!
//! This crate provides:
//! - Port allocation
//! - Condition-based waiting (no hardcoded sleeps)
//! - A mock CoAP end device on a real UDP socket, or behind DTLS-PSK
//! - Directory fixtures

use bytes::Bytes;
use coap_lite::{MessageClass, MessageType, Packet, ResponseType};
use devcoap_core::packet::{self, new_packet};
use devcoap_core::{
    DeviceProfile, InMemoryDirectory, PacketExt, ProtocolProperties, Protocols, ResourceRecord,
};
use devcoap_transport::{DatagramChannel, DtlsListener};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Mock End Device
// ============================================================================

/// How the mock device answers a request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Piggybacked response in the ACK
    Piggyback { code: ResponseType, payload: Bytes },
    /// Empty ACK, then a separate CON response
    Separate { code: ResponseType, payload: Bytes },
    /// Reset the request
    Reset,
    /// Never answer
    Drop,
}

impl MockReply {
    /// 2.05 Content with a text payload
    pub fn content(payload: &str) -> Self {
        MockReply::Piggyback {
            code: ResponseType::Content,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    /// 2.04 Changed without payload
    pub fn changed() -> Self {
        MockReply::Piggyback {
            code: ResponseType::Changed,
            payload: Bytes::new(),
        }
    }
}

/// A request the mock device saw
#[derive(Debug, Clone)]
pub struct MockExchange {
    pub request: Packet,
    pub received_at: Instant,
    pub replied_at: Option<Instant>,
}

type Handler = dyn Fn(&Packet) -> MockReply + Send + Sync;

/// Datagrams answering `request`, or `None` to stay silent
fn answer(handler: &Handler, request: &Packet, next_id: u16) -> Option<Vec<Packet>> {
    let mid = request.header.message_id;
    let datagrams = match handler(request) {
        MockReply::Piggyback { code, payload } => {
            vec![packet::response_to(request, code, 0).with_payload(payload.to_vec())]
        }
        MockReply::Separate { code, payload } => vec![
            packet::empty_ack(mid),
            new_packet(MessageType::Confirmable, MessageClass::Response(code), next_id)
                .with_token(request.get_token().to_vec())
                .with_payload(payload.to_vec()),
        ],
        MockReply::Reset => vec![packet::reset(mid)],
        MockReply::Drop => return None,
    };
    Some(datagrams)
}

/// Append `request` to the log, returning its index
fn record(log: &Mutex<Vec<MockExchange>>, request: &Packet) -> usize {
    debug!(
        "mock device got {} {}",
        packet::code_text(request.header.code),
        request.uri_path_string()
    );
    let mut log = log.lock();
    log.push(MockExchange {
        request: request.clone(),
        received_at: Instant::now(),
        replied_at: None,
    });
    log.len() - 1
}

/// A CoAP end device answering on 127.0.0.1. Stops when dropped.
pub struct MockDevice {
    addr: SocketAddr,
    exchanges: Arc<Mutex<Vec<MockExchange>>>,
    handle: JoinHandle<()>,
}

impl MockDevice {
    /// Start a device answering every request the same way
    pub async fn with_reply(reply: MockReply) -> Self {
        Self::start(move |_| reply.clone(), Duration::ZERO).await
    }

    /// Start a device that asks `handler` how to answer, waiting `delay`
    /// before each answer. `replied_at` is stamped just before the answer
    /// goes out.
    pub async fn start<F>(handler: F, delay: Duration) -> Self
    where
        F: Fn(&Packet) -> MockReply + Send + Sync + 'static,
    {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let exchanges = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let log = Arc::clone(&exchanges);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut next_id: u16 = 0x4000;
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let request = match packet::decode(&buf[..len]) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if !request.is_request() {
                    // ACKs for our separate responses
                    continue;
                }
                let index = record(&log, &request);

                next_id = next_id.wrapping_add(1);
                let Some(datagrams) = answer(handler.as_ref(), &request, next_id) else {
                    continue;
                };

                // answer off the receive loop so requests keep arriving meanwhile
                let socket = Arc::clone(&socket);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    log.lock()[index].replied_at = Some(Instant::now());
                    for message in &datagrams {
                        let _ = socket.send_to(&packet::encode(message).unwrap(), from).await;
                    }
                });
            }
        });

        Self {
            addr,
            exchanges,
            handle,
        }
    }

    /// Start a device behind a DTLS-PSK listener sharing `key`.
    ///
    /// Each client session is served on its own task until the client
    /// closes it. `delay` applies as for [`MockDevice::start`].
    pub async fn start_psk<F>(handler: F, key: &[u8], delay: Duration) -> Self
    where
        F: Fn(&Packet) -> MockReply + Send + Sync + 'static,
    {
        let listener = DtlsListener::bind("127.0.0.1:0".parse().unwrap(), b"", key)
            .await
            .unwrap();
        let addr = listener.local_addr();
        let exchanges = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let log = Arc::clone(&exchanges);
        let handle = tokio::spawn(async move {
            loop {
                let channel = match listener.accept().await {
                    Ok(channel) => channel,
                    Err(_) => continue,
                };
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let mut next_id: u16 = 0x6000;
                    while let Ok(len) = channel.recv(&mut buf).await {
                        let Ok(request) = packet::decode(&buf[..len]) else {
                            continue;
                        };
                        if !request.is_request() {
                            continue;
                        }
                        let index = record(&log, &request);

                        next_id = next_id.wrapping_add(1);
                        let Some(datagrams) = answer(handler.as_ref(), &request, next_id) else {
                            continue;
                        };
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        log.lock()[index].replied_at = Some(Instant::now());
                        for message in &datagrams {
                            if channel.send(&packet::encode(message).unwrap()).await.is_err() {
                                break;
                            }
                        }
                    }
                    let _ = channel.close().await;
                });
            }
        });

        Self {
            addr,
            exchanges,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Everything received so far
    pub fn exchanges(&self) -> Vec<MockExchange> {
        self.exchanges.lock().clone()
    }

    pub fn requests(&self) -> Vec<Packet> {
        self.exchanges
            .lock()
            .iter()
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.exchanges.lock().len()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Directory Fixtures
// ============================================================================

/// Protocol block for a NoSec device at `host`
pub fn nosec_protocols(host: &str) -> Protocols {
    coap_protocols(&[("ED_ADDR", host), ("ED_SecurityMode", "NoSec")])
}

/// Protocol block for a PSK device at `host`
pub fn psk_protocols(host: &str, key: &str) -> Protocols {
    coap_protocols(&[
        ("ED_ADDR", host),
        ("ED_SecurityMode", "PSK"),
        ("ED_PskKey", key),
    ])
}

/// A `COAP` protocol block with the given properties
pub fn coap_protocols(pairs: &[(&str, &str)]) -> Protocols {
    let props: ProtocolProperties = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut protocols = Protocols::new();
    protocols.insert("COAP".to_string(), props);
    protocols
}

/// The `sensor` profile: `temperature` (Float64), `count` (Int32),
/// `label` (String) and `flag` (Bool, which has no codec)
pub fn sensor_profile() -> DeviceProfile {
    DeviceProfile::new("sensor")
        .with_resource(ResourceRecord::new("temperature", "Float64"))
        .with_resource(ResourceRecord::new("count", "Int32"))
        .with_resource(ResourceRecord::new("label", "String"))
        .with_resource(ResourceRecord::new("flag", "Bool"))
}

/// Key text of the `secure` fixture device
pub const FIXTURE_PSK_KEY: &str = "fixture-psk-key";

/// A directory with `dev1` (NoSec at 127.0.0.1) and `secure` (PSK at
/// 127.0.0.1 with [`FIXTURE_PSK_KEY`]) using the sensor profile, and `broken`
/// whose protocol block has no address
pub fn fixture_directory() -> Arc<InMemoryDirectory> {
    let directory = InMemoryDirectory::new();
    directory.add_profile(sensor_profile());
    directory
        .add_device("dev1", &["sensor"], nosec_protocols("127.0.0.1"))
        .unwrap();
    directory
        .add_device(
            "secure",
            &["sensor"],
            psk_protocols("127.0.0.1", FIXTURE_PSK_KEY),
        )
        .unwrap();
    directory
        .add_device(
            "broken",
            &["sensor"],
            coap_protocols(&[("ED_SecurityMode", "NoSec")]),
        )
        .unwrap();
    Arc::new(directory)
}
