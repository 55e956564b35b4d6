//! End-device address resolution
//!
//! Each device carries a property bag per protocol. The `COAP` bag names the
//! device's network address and its transport security:
//!
//! ```text
//! ED_ADDR          = "192.0.2.10" | "fd00::10" | "sensor.local"
//! ED_SecurityMode  = "NoSec" | "PSK"
//! ED_PskKey        = "<key text>"          (required iff PSK)
//! ```

use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

use crate::{Error, Result, SecurityMode};

/// Property bag of one protocol block
pub type ProtocolProperties = HashMap<String, String>;

/// All protocol blocks of a device, keyed by protocol name
pub type Protocols = HashMap<String, ProtocolProperties>;

/// Property key for the end device network address
pub const ADDRESS_KEY: &str = "ED_ADDR";
/// Property key for the end device security mode
pub const SECURITY_MODE_KEY: &str = "ED_SecurityMode";
/// Property key for the end device pre-shared key
pub const PSK_KEY_KEY: &str = "ED_PskKey";

/// Longest accepted host text (fits an IPv6 literal or a DNS name)
pub const MAX_ADDRESS_LEN: usize = 255;
/// Longest accepted pre-shared key
pub const MAX_PSK_KEY_LEN: usize = 64;

/// Transport parameters of one end device.
///
/// Built once when the device is registered and immutable afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct EndDeviceAddress {
    host: String,
    security_mode: SecurityMode,
    psk_key: Option<Vec<u8>>,
}

impl EndDeviceAddress {
    /// Unsecured address
    pub fn nosec(host: impl Into<String>) -> Result<Self> {
        let host = validate_host(host.into())?;
        Ok(Self {
            host,
            security_mode: SecurityMode::None,
            psk_key: None,
        })
    }

    /// Pre-shared-key secured address
    pub fn psk(host: impl Into<String>, key: impl Into<Vec<u8>>) -> Result<Self> {
        let host = validate_host(host.into())?;
        let key = validate_psk_key(key.into())?;
        Ok(Self {
            host,
            security_mode: SecurityMode::PreSharedKey,
            psk_key: Some(key),
        })
    }

    /// Resolve the address from a device's protocol blocks.
    pub fn from_protocols(protocols: &Protocols, protocol_name: &str) -> Result<Self> {
        let props = protocols
            .get(protocol_name)
            .ok_or_else(|| Error::MissingProtocol(protocol_name.to_string()))?;
        Self::from_properties(props)
    }

    /// Resolve the address from a single protocol property bag.
    pub fn from_properties(props: &ProtocolProperties) -> Result<Self> {
        let host = required(props, ADDRESS_KEY)?;
        debug!("End dev addr = {}", host);

        let mode_text = required(props, SECURITY_MODE_KEY)?;
        debug!("End dev SecMode = {}", mode_text);

        match SecurityMode::from_text(mode_text) {
            SecurityMode::None => Self::nosec(host),
            SecurityMode::PreSharedKey => {
                let key = required(props, PSK_KEY_KEY)?;
                if key.is_empty() {
                    error!("End device PSK key not in configuration");
                    return Err(Error::MissingPskKey);
                }
                debug!("End dev PSK key len {}", key.len());
                Self::psk(host, key.as_bytes())
            }
            SecurityMode::Unknown => {
                error!("End device unknown security mode {}", mode_text);
                Err(Error::UnknownSecurityMode(mode_text.to_string()))
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Key bytes; present iff the mode is PreSharedKey
    pub fn psk_key(&self) -> Option<&[u8]> {
        self.psk_key.as_deref()
    }
}

impl fmt::Debug for EndDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndDeviceAddress")
            .field("host", &self.host)
            .field("security_mode", &self.security_mode)
            .field("psk_key_len", &self.psk_key.as_ref().map(|k| k.len()))
            .finish()
    }
}

fn required<'a>(props: &'a ProtocolProperties, key: &str) -> Result<&'a str> {
    props
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::MissingProperty(key.to_string()))
}

fn validate_host(host: String) -> Result<String> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(Error::MissingProperty(ADDRESS_KEY.to_string()));
    }
    if trimmed.len() > MAX_ADDRESS_LEN {
        return Err(Error::Configuration(format!(
            "{} longer than {} bytes",
            ADDRESS_KEY, MAX_ADDRESS_LEN
        )));
    }
    // Bracketed IPv6 literals are accepted as written in URIs
    Ok(trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string())
}

fn validate_psk_key(key: Vec<u8>) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(Error::MissingPskKey);
    }
    if key.len() > MAX_PSK_KEY_LEN {
        return Err(Error::InvalidPskKey(format!(
            "{} bytes exceeds maximum of {}",
            key.len(),
            MAX_PSK_KEY_LEN
        )));
    }
    Ok(key)
}
