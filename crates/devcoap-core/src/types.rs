//! Value model shared by the client and server paths

use serde::{Deserialize, Serialize};
use std::fmt;

/// CoAP content-format identifiers used by the service
pub mod content_format {
    /// text/plain;charset=utf-8
    pub const TEXT_PLAIN: u16 = 0;
    /// application/json
    pub const APPLICATION_JSON: u16 = 50;
    /// Sentinel for a request without a Content-Format option
    pub const UNDEFINED: u16 = u16::MAX;
}

/// A typed resource value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int32(i32),
    Float64(f64),
    String(String),
}

impl Value {
    /// The resource type this value encodes as
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Value::Float64(_) => ResourceType::Float64,
            Value::Int32(_) => ResourceType::Int32,
            Value::String(_) => ResourceType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float64(v) => write!(f, "{:.6}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Declared type of a device resource.
///
/// Profiles may declare types the service has no codec for; those are kept as
/// `Other` and rejected when a value is encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceType {
    Float64,
    Int32,
    String,
    Other(String),
}

impl ResourceType {
    pub fn name(&self) -> &str {
        match self {
            ResourceType::Float64 => "Float64",
            ResourceType::Int32 => "Int32",
            ResourceType::String => "String",
            ResourceType::Other(name) => name,
        }
    }

    /// Content-formats an inbound payload may declare for this type
    pub fn accepted_formats(&self) -> &'static [u16] {
        match self {
            ResourceType::Float64 | ResourceType::Int32 => &[content_format::TEXT_PLAIN],
            ResourceType::String => &[
                content_format::TEXT_PLAIN,
                content_format::APPLICATION_JSON,
            ],
            ResourceType::Other(_) => &[],
        }
    }

    pub fn accepts_format(&self, format: u16) -> bool {
        self.accepted_formats().contains(&format)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ResourceType::Other(_))
    }
}

impl From<String> for ResourceType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Float64" => ResourceType::Float64,
            "Int32" => ResourceType::Int32,
            "String" => ResourceType::String,
            _ => ResourceType::Other(s),
        }
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        ResourceType::from(s.to_string())
    }
}

impl From<ResourceType> for String {
    fn from(t: ResourceType) -> Self {
        t.name().to_string()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport security mode of an end device or of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityMode {
    #[default]
    None,
    PreSharedKey,
    /// Terminal validation failure; never used to open a session
    Unknown,
}

impl SecurityMode {
    /// Map configuration text to a mode. Matching is exact and case-sensitive.
    pub fn from_text(text: &str) -> Self {
        match text {
            "PSK" => SecurityMode::PreSharedKey,
            "NoSec" => SecurityMode::None,
            _ => SecurityMode::Unknown,
        }
    }

    /// Default CoAP port for this mode
    pub fn default_port(&self) -> u16 {
        match self {
            SecurityMode::PreSharedKey => crate::COAPS_PORT,
            _ => crate::COAP_PORT,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SecurityMode::PreSharedKey => "coaps",
            _ => "coap",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SecurityMode::None => "NoSec",
            SecurityMode::PreSharedKey => "PSK",
            SecurityMode::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A reading handed to the caller of GET or to the delivery sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Origin timestamp; 0 when the device did not supply one
    pub origin: u64,
    pub value: Value,
}

impl CommandResult {
    pub fn new(value: Value) -> Self {
        Self { origin: 0, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_mode_exact_match() {
        assert_eq!(SecurityMode::from_text("PSK"), SecurityMode::PreSharedKey);
        assert_eq!(SecurityMode::from_text("NoSec"), SecurityMode::None);
        assert_eq!(SecurityMode::from_text("psk"), SecurityMode::Unknown);
        assert_eq!(SecurityMode::from_text("nosec"), SecurityMode::Unknown);
        assert_eq!(SecurityMode::from_text(""), SecurityMode::Unknown);
    }

    #[test]
    fn test_security_mode_ports() {
        assert_eq!(SecurityMode::None.default_port(), 5683);
        assert_eq!(SecurityMode::PreSharedKey.default_port(), 5684);
        assert_eq!(SecurityMode::PreSharedKey.scheme(), "coaps");
    }

    #[test]
    fn test_resource_type_formats() {
        assert!(ResourceType::Float64.accepts_format(content_format::TEXT_PLAIN));
        assert!(!ResourceType::Float64.accepts_format(content_format::APPLICATION_JSON));
        assert!(!ResourceType::Int32.accepts_format(content_format::UNDEFINED));
        assert!(ResourceType::String.accepts_format(content_format::APPLICATION_JSON));
        assert!(!ResourceType::from("Bool").accepts_format(content_format::TEXT_PLAIN));
    }

    #[test]
    fn test_resource_type_from_text() {
        assert_eq!(ResourceType::from("Int32"), ResourceType::Int32);
        assert_eq!(
            ResourceType::from("Uint8"),
            ResourceType::Other("Uint8".to_string())
        );
        assert_eq!(String::from(ResourceType::Float64), "Float64");
    }
}
