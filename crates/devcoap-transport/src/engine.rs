//! CoAP message layer
//!
//! The engine owns one session's channel and turns confirmable requests into
//! exactly one terminal event: a matching response or a negative
//! acknowledgment. It assigns message ids and tokens, matches piggybacked and
//! separate responses, acknowledges separate responses, and retransmits until
//! the request is acknowledged or the retransmission budget runs out.

use bytes::Bytes;
use coap_lite::{MessageType, Packet};
use devcoap_core::packet::{self, code_text, PacketExt};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::channel::DatagramChannel;
use crate::error::{Result, TransportError};

/// Length of generated request tokens
pub const TOKEN_LEN: usize = 4;

/// Message-layer timing
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Initial retransmission timeout
    pub ack_timeout: Duration,
    /// Upper bound of the random factor applied to the first timeout
    pub ack_random_factor: f64,
    /// Retransmissions before giving up
    pub max_retransmit: u32,
    /// How long to wait for a separate response once the request is acknowledged
    pub exchange_lifetime: Duration,
    /// Receive buffer size
    pub max_datagram_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            max_datagram_size: 1152,
        }
    }
}

/// Why a confirmable request could not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    TooManyRetries,
    NotDeliverable,
    Reset,
    TlsFailed,
    IcmpIssue,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NackReason::TooManyRetries => "too many retries",
            NackReason::NotDeliverable => "not deliverable",
            NackReason::Reset => "reset",
            NackReason::TlsFailed => "tls failed",
            NackReason::IcmpIssue => "icmp issue",
        };
        f.write_str(text)
    }
}

/// Terminal event for a submitted request
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Response(Packet),
    Nack(NackReason),
}

/// An in-flight confirmable request
#[derive(Debug)]
pub struct Submitted {
    pub message_id: u16,
    pub token: Bytes,
    wire: Bytes,
    retransmits: u32,
    timeout: Duration,
    deadline: Instant,
    acked: bool,
}

impl Submitted {
    /// Whether an empty ACK has been received
    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }
}

/// Message layer over one channel
pub struct Engine {
    channel: Arc<dyn DatagramChannel>,
    config: EngineConfig,
    next_message_id: Mutex<u16>,
}

impl Engine {
    pub fn new(channel: Arc<dyn DatagramChannel>, config: EngineConfig) -> Self {
        let start: u16 = rand::thread_rng().gen();
        Self {
            channel,
            config,
            next_message_id: Mutex::new(start),
        }
    }

    pub fn channel(&self) -> &Arc<dyn DatagramChannel> {
        &self.channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn allocate_message_id(&self) -> u16 {
        let mut next = self.next_message_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    /// Send `request` as a confirmable message with a fresh message id and token.
    ///
    /// Fails without sending anything further when the request cannot be
    /// encoded or the first transmission is refused.
    pub async fn submit(&self, mut request: Packet) -> Result<Submitted> {
        let message_id = self.allocate_message_id();
        let token: [u8; TOKEN_LEN] = rand::thread_rng().gen();
        request.header.set_type(MessageType::Confirmable);
        request.header.message_id = message_id;
        request.set_token(token.to_vec());

        let wire = Bytes::from(packet::encode(&request)?);
        self.channel.send(&wire).await.map_err(|e| {
            warn!("send of message {} failed: {}", message_id, e);
            e
        })?;
        debug!(
            "sent {} mid={} to {}",
            code_text(request.header.code),
            message_id,
            self.channel.peer_addr()
        );

        let timeout = self.initial_timeout();
        Ok(Submitted {
            message_id,
            token: Bytes::copy_from_slice(&token),
            wire,
            retransmits: 0,
            timeout,
            deadline: Instant::now() + timeout,
            acked: false,
        })
    }

    fn initial_timeout(&self) -> Duration {
        let factor = if self.config.ack_random_factor > 1.0 {
            rand::thread_rng().gen_range(1.0..self.config.ack_random_factor)
        } else {
            1.0
        };
        self.config.ack_timeout.mul_f64(factor)
    }

    /// Run one round of I/O for `pending`.
    ///
    /// Waits for either a datagram or the next retransmission deadline.
    /// Returns `None` while the exchange is still open. Dropping the returned
    /// future between rounds loses nothing.
    pub async fn process_io(&self, pending: &mut Submitted) -> Option<EngineEvent> {
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let received = tokio::select! {
            received = self.channel.recv(&mut buf) => received,
            _ = sleep_until(pending.deadline) => return self.on_timeout(pending).await,
        };

        match received {
            Ok(len) => self.handle_datagram(pending, &buf[..len]).await,
            Err(TransportError::Tls(e)) => {
                warn!("dtls receive failed: {}", e);
                Some(EngineEvent::Nack(NackReason::TlsFailed))
            }
            Err(e) => {
                warn!("receive failed: {}", e);
                Some(EngineEvent::Nack(NackReason::IcmpIssue))
            }
        }
    }

    /// Drive `pending` until it reaches a terminal event
    pub async fn wait(&self, pending: &mut Submitted) -> EngineEvent {
        loop {
            if let Some(event) = self.process_io(pending).await {
                return event;
            }
        }
    }

    async fn on_timeout(&self, pending: &mut Submitted) -> Option<EngineEvent> {
        if pending.acked {
            info!(
                "no separate response for mid={} within exchange lifetime",
                pending.message_id
            );
            return Some(EngineEvent::Nack(NackReason::TooManyRetries));
        }
        if pending.retransmits >= self.config.max_retransmit {
            return Some(EngineEvent::Nack(NackReason::TooManyRetries));
        }

        pending.retransmits += 1;
        pending.timeout *= 2;
        pending.deadline = Instant::now() + pending.timeout;
        debug!(
            "retransmit {} of mid={}",
            pending.retransmits, pending.message_id
        );
        if let Err(e) = self.channel.send(&pending.wire).await {
            warn!("retransmission failed: {}", e);
            return Some(EngineEvent::Nack(match e {
                TransportError::Tls(_) => NackReason::TlsFailed,
                _ => NackReason::NotDeliverable,
            }));
        }
        None
    }

    async fn handle_datagram(&self, pending: &mut Submitted, data: &[u8]) -> Option<EngineEvent> {
        let message = match packet::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable datagram of len {}: {}", data.len(), e);
                return None;
            }
        };

        let mid = message.header.message_id;
        let token_matches = message.get_token() == &pending.token[..];
        match message.message_type() {
            MessageType::Acknowledgement if mid == pending.message_id => {
                if message.is_empty_message() {
                    debug!("mid={} acknowledged, awaiting separate response", pending.message_id);
                    pending.acked = true;
                    pending.deadline = Instant::now() + self.config.exchange_lifetime;
                    return None;
                }
                if !token_matches {
                    debug!("ACK for mid={} carries a foreign token", pending.message_id);
                    return None;
                }
                Some(EngineEvent::Response(message))
            }
            MessageType::Reset if mid == pending.message_id => {
                Some(EngineEvent::Nack(NackReason::Reset))
            }
            MessageType::Confirmable | MessageType::NonConfirmable
                if message.is_response() && token_matches =>
            {
                if message.message_type() == MessageType::Confirmable {
                    self.send_quietly(packet::empty_ack(mid)).await;
                }
                Some(EngineEvent::Response(message))
            }
            MessageType::Confirmable => {
                debug!("rejecting unexpected CON mid={}", mid);
                self.send_quietly(packet::reset(mid)).await;
                None
            }
            other => {
                debug!("ignoring unmatched {:?} mid={}", other, mid);
                None
            }
        }
    }

    async fn send_quietly(&self, message: Packet) {
        match packet::encode(&message) {
            Ok(wire) => {
                if let Err(e) = self.channel.send(&wire).await {
                    debug!("failed to send {:?}: {}", message.message_type(), e);
                }
            }
            Err(e) => debug!("failed to encode {:?}: {}", message.message_type(), e),
        }
    }
}
