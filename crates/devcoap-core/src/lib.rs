//! device-coap core
//!
//! Types and pure protocol logic shared by the client and server sides of the
//! CoAP device service:
//! - Value model ([`Value`], [`ResourceType`], [`SecurityMode`])
//! - End-device address resolution ([`EndDeviceAddress`])
//! - Text payload codec ([`codec`])
//! - `/a1r/{device}/{resource}` routing ([`uri`])
//! - Device directory ([`Directory`], [`InMemoryDirectory`])
//! - CoAP packet helpers over `coap_lite` ([`packet`])

pub mod address;
pub mod codec;
pub mod directory;
pub mod error;
pub mod packet;
pub mod types;
pub mod uri;

pub use address::{EndDeviceAddress, ProtocolProperties, Protocols};
pub use directory::{DeviceProfile, DeviceRecord, Directory, InMemoryDirectory, ResourceRecord};
pub use error::{CodecError, Error, Result, RoutingError};
pub use packet::PacketExt;
pub use types::*;
pub use uri::{parse_path, PathIdentity, UriPath};

/// First path segment of every routed URI
pub const ROUTING_SEGMENT: &str = "a1r";

/// Protocol block name in a device's protocol properties
pub const PROTOCOL_NAME: &str = "COAP";

/// Default CoAP port
pub const COAP_PORT: u16 = 5683;

/// Default CoAP over DTLS port
pub const COAPS_PORT: u16 = 5684;

/// PSK identity presented by the client side
pub const CLIENT_IDENTITY_HINT: &str = "r17";
