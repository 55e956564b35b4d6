//! Error types for device-coap core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic configuration problem
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The device has no property bag for the requested protocol
    #[error("no {0} protocol in device address")]
    MissingProtocol(String),

    /// A required property is absent from the protocol property bag
    #[error("property in device address missing: {0}")]
    MissingProperty(String),

    /// Security mode text did not match a known mode
    #[error("unknown security mode: {0}")]
    UnknownSecurityMode(String),

    /// PreSharedKey mode without a usable key
    #[error("PSK key not in configuration")]
    MissingPskKey,

    /// PSK key present but not decodable
    #[error("invalid PSK key: {0}")]
    InvalidPskKey(String),

    /// Inbound URI routing failure
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Payload encode/decode failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// CoAP message framing error
    #[error("message error: {0}")]
    Message(String),
}

/// URI routing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// First segment is not the routing literal
    #[error("invalid URI; segment 0: {0}")]
    InvalidUri(String),

    /// Fewer than three segments
    #[error("missing URI segment {0}")]
    MissingSegment(usize),

    /// Second segment names no known device
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Third segment names no resource of the device
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// A fourth segment follows a valid identity
    #[error("extra URI segment: {0}")]
    ExtraSegment(String),

    /// Segment cannot be carried in a path option
    #[error("URI segment too long: {0} bytes")]
    SegmentTooLong(usize),
}

/// Payload codec failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input exceeds the per-type scratch limit
    #[error("invalid {kind} of len {len} (max {max})")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// Text does not parse as the declared type
    #[error("invalid {kind} of len {len}")]
    Invalid { kind: &'static str, len: usize },

    /// Parsed number does not fit the declared type
    #[error("{kind} out of range")]
    OutOfRange { kind: &'static str },

    /// Resource type has no codec
    #[error("unsupported resource type {0}")]
    UnsupportedType(String),

    /// Value variant does not match the declared resource type
    #[error("value of type {value} cannot be written to resource of type {declared}")]
    TypeMismatch { value: String, declared: String },

    /// Content-format option not acceptable for the resource type
    #[error("content-format {format} not acceptable for {declared}")]
    ContentFormatMismatch { format: u16, declared: String },

    /// Request carried no payload
    #[error("no payload data")]
    NoData,
}
