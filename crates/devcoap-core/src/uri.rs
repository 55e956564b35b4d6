//! URI routing
//!
//! Every exchange addresses exactly one resource of one device:
//!
//! ```text
//! /a1r/{device-name}/{resource-name}
//! ```
//!
//! Outbound, [`UriPath`] produces the Uri-Path option values in order.
//! Inbound, [`parse_path`] walks the three segments against a [`Directory`].

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::directory::{DeviceRecord, Directory, ResourceRecord};
use crate::error::RoutingError;
use crate::ROUTING_SEGMENT;

/// Longest value a single Uri-Path option may carry
pub const MAX_SEGMENT_LEN: usize = 255;

/// Outbound request path for one (device, resource) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPath {
    segments: [String; 3],
}

impl UriPath {
    pub fn new(device: &str, resource: &str) -> Result<Self, RoutingError> {
        for seg in [device, resource] {
            if seg.len() > MAX_SEGMENT_LEN {
                return Err(RoutingError::SegmentTooLong(seg.len()));
            }
        }
        Ok(Self {
            segments: [
                ROUTING_SEGMENT.to_string(),
                device.to_string(),
                resource.to_string(),
            ],
        })
    }

    /// Segment values in order, as carried by Uri-Path options
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn device(&self) -> &str {
        &self.segments[1]
    }

    pub fn resource(&self) -> &str {
        &self.segments[2]
    }
}

impl fmt::Display for UriPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, "/{}", percent_encode(seg))?;
        }
        Ok(())
    }
}

/// A routed inbound path: the resolved device and resource.
///
/// Holding this keeps the device record alive; dropping it releases it.
#[derive(Debug, Clone)]
pub struct PathIdentity {
    pub device: Arc<DeviceRecord>,
    pub resource: ResourceRecord,
}

impl PathIdentity {
    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn resource_name(&self) -> &str {
        &self.resource.name
    }
}

/// Route an inbound path.
///
/// The path is percent-decoded as a whole, split on `/` (empty segments are
/// skipped), and must contain exactly the routing literal, a known device and
/// one of that device's resources.
pub fn parse_path<D>(directory: &D, path: &str) -> Result<PathIdentity, RoutingError>
where
    D: Directory + ?Sized,
{
    debug!("URI to decode = {}", path);
    let decoded = percent_decode(path);
    debug!("URI is decoded as = {}", decoded);

    let mut segments = decoded.split('/').filter(|s| !s.is_empty());

    let literal = segments.next().ok_or_else(|| missing(0))?;
    if literal != ROUTING_SEGMENT {
        info!("invalid URI; segment 0: {}", literal);
        return Err(RoutingError::InvalidUri(literal.to_string()));
    }

    let device_name = segments.next().ok_or_else(|| missing(1))?;
    let device = directory.device(device_name).ok_or_else(|| {
        info!("device not found: {}", device_name);
        RoutingError::DeviceNotFound(device_name.to_string())
    })?;

    let resource_name = segments.next().ok_or_else(|| missing(2))?;
    let resource = device.resource(resource_name).cloned().ok_or_else(|| {
        info!("resource not found: {}", resource_name);
        RoutingError::ResourceNotFound(resource_name.to_string())
    })?;

    if let Some(extra) = segments.next() {
        info!("extra URI segment");
        return Err(RoutingError::ExtraSegment(extra.to_string()));
    }

    Ok(PathIdentity { device, resource })
}

fn missing(index: usize) -> RoutingError {
    info!("missing URI segment {}", index);
    RoutingError::MissingSegment(index)
}

/// Percent-encode a path segment (RFC 3986 unreserved characters pass through)
pub fn percent_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Percent-decode text. Malformed escapes are copied through unchanged.
pub fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
