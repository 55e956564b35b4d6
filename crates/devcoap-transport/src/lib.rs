//! device-coap transport layer
//!
//! This crate moves CoAP datagrams for the device service:
//! - host resolution (IPv4 and IPv6)
//! - datagram channels: plain UDP, and DTLS-PSK behind the `dtls` feature
//! - the session manager, one session per exchange
//! - the message layer that drives a confirmable request to its outcome

pub mod channel;
pub mod engine;
pub mod error;
pub mod resolve;
pub mod session;

#[cfg(feature = "dtls")]
pub mod dtls;

pub use channel::{DatagramChannel, UdpChannel};
pub use engine::{Engine, EngineConfig, EngineEvent, NackReason, Submitted};
pub use error::{Result, TransportError};
pub use resolve::resolve_address;
pub use session::{
    Session, SessionConfig, SessionManager, SessionParams, SessionProtocol,
    DEFAULT_HANDSHAKE_TIMEOUT,
};

#[cfg(feature = "dtls")]
pub use dtls::{DtlsChannel, DtlsListener};
