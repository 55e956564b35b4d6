//! device-coap inbound server
//!
//! Devices push readings with CoAP POST requests. This crate provides:
//! - [`IngestHandler`]: routes, validates and decodes one request
//! - [`CoapServer`]: the UDP or DTLS-PSK listener loop
//! - [`DeliverySink`] and its channel and JSON-lines implementations

pub mod error;
pub mod ingest;
pub mod server;
pub mod sink;

pub use error::{Result, ServerError};
pub use ingest::{IngestHandler, IngestResponse, MSG_PAYLOAD_INVALID};
pub use server::{CoapServer, ServerConfig};
pub use sink::{ChannelSink, DeliverySink, JsonLinesSink, Reading};
