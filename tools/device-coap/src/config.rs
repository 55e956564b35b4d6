//! Service configuration.
//!
//! One TOML file holds the driver settings, device profiles and devices. An
//! optional secrets file carries the driver PSK key:
//!
//! ```toml
//! [driver]
//! CoapBindAddr = "0.0.0.0"
//! SecurityMode = "PSK"
//! PskKey = "c2VjcmV0"
//!
//! [[profiles]]
//! name = "sensor"
//! [[profiles.resources]]
//! name = "temperature"
//! value_type = "Float64"
//!
//! [[devices]]
//! name = "dev1"
//! profile = "sensor"
//! [devices.protocols.COAP]
//! ED_ADDR = "10.0.0.7"
//! ED_SecurityMode = "NoSec"
//! ```

use base64::Engine;
use devcoap_core::{DeviceProfile, InMemoryDirectory, Protocols, SecurityMode};
use devcoap_server::ServerConfig;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Contents of the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// `[driver]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriverConfig {
    #[serde(default = "default_bind_addr")]
    pub coap_bind_addr: String,

    #[serde(default = "default_security_mode")]
    pub security_mode: String,

    /// Base64 PSK key
    #[serde(default)]
    pub psk_key: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_security_mode() -> String {
    "NoSec".to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            coap_bind_addr: default_bind_addr(),
            security_mode: default_security_mode(),
            psk_key: String::new(),
        }
    }
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub profile: String,
    #[serde(default)]
    pub protocols: Protocols,
}

/// Contents of the secrets file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub psk: Option<PskSecret>,
}

/// `[psk]` table of the secrets file
#[derive(Debug, Clone, Deserialize)]
pub struct PskSecret {
    #[serde(rename = "PskKey")]
    pub psk_key: String,
}

impl Secrets {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Driver settings after validation
#[derive(Clone)]
pub struct DriverSettings {
    pub bind_addr: String,
    pub security_mode: SecurityMode,
    /// Decoded key, present in PSK mode only
    pub psk_key: Option<Vec<u8>>,
}

impl DriverSettings {
    /// Listener configuration for these settings
    pub fn server_config(&self, port: Option<u16>) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            security_mode: self.security_mode,
            psk_key: self.psk_key.clone(),
            port,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Every device must name a declared profile
    pub fn validate(&self) -> Result<(), ConfigError> {
        for device in &self.devices {
            if !self.profiles.iter().any(|p| p.name == device.profile) {
                return Err(ConfigError::Invalid(format!(
                    "device {}: unknown profile {}",
                    device.name, device.profile
                )));
            }
        }
        Ok(())
    }

    /// Validate the driver section, taking the PSK key from `secrets` when it
    /// carries one
    pub fn driver_settings(&self, secrets: Option<&Secrets>) -> Result<DriverSettings, ConfigError> {
        let security_mode = SecurityMode::from_text(&self.driver.security_mode);
        info!("CoAP driver security mode: {}", self.driver.security_mode);

        let psk_key = match security_mode {
            SecurityMode::None => None,
            SecurityMode::PreSharedKey => {
                let encoded = secrets
                    .and_then(|s| s.psk.as_ref())
                    .map(|p| p.psk_key.as_str())
                    .unwrap_or(self.driver.psk_key.as_str());
                if encoded.is_empty() {
                    return Err(ConfigError::Invalid(
                        "PSK mode requires a PskKey".to_string(),
                    ));
                }
                let key = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ConfigError::Invalid(format!("PskKey is not base64: {}", e)))?;
                if key.is_empty() {
                    return Err(ConfigError::Invalid("PskKey decodes to nothing".to_string()));
                }
                debug!("driver PSK key length {}", key.len());
                Some(key)
            }
            SecurityMode::Unknown => {
                return Err(ConfigError::Invalid(format!(
                    "unknown security mode: {}",
                    self.driver.security_mode
                )))
            }
        };

        Ok(DriverSettings {
            bind_addr: self.driver.coap_bind_addr.clone(),
            security_mode,
            psk_key,
        })
    }

    /// Register the configured profiles and devices
    pub fn build_directory(&self) -> Result<InMemoryDirectory, ConfigError> {
        let directory = InMemoryDirectory::new();
        for profile in &self.profiles {
            directory.add_profile(profile.clone());
        }
        for device in &self.devices {
            directory
                .add_device(&device.name, &[device.profile.as_str()], device.protocols.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        info!(
            "Loaded {} profiles and {} devices",
            self.profiles.len(),
            directory.len()
        );
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcoap_core::{Directory, ResourceType};
    use std::io::Write;

    const SAMPLE: &str = r#"
[driver]
CoapBindAddr = "127.0.0.1"
SecurityMode = "PSK"
PskKey = "c2VjcmV0"

[[profiles]]
name = "sensor"

[[profiles.resources]]
name = "temperature"
value_type = "Float64"

[[profiles.resources]]
name = "flag"
value_type = "Bool"

[[devices]]
name = "dev1"
profile = "sensor"

[devices.protocols.COAP]
ED_ADDR = "10.0.0.7"
ED_SecurityMode = "NoSec"

[[devices]]
name = "dev2"
profile = "sensor"

[devices.protocols.COAP]
ED_SecurityMode = "NoSec"
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn driver_only(mode: &str, key: &str) -> ServiceConfig {
        ServiceConfig {
            driver: DriverConfig {
                security_mode: mode.to_string(),
                psk_key: key.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_load_sample() {
        let file = write_temp(SAMPLE);
        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.driver.coap_bind_addr, "127.0.0.1");
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(
            config.profiles[0].resources[1].value_type,
            ResourceType::Other("Bool".to_string())
        );
        assert_eq!(config.devices.len(), 2);

        let settings = config.driver_settings(None).unwrap();
        assert_eq!(settings.security_mode, SecurityMode::PreSharedKey);
        assert_eq!(settings.psk_key.as_deref(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.driver.coap_bind_addr, "0.0.0.0");
        let settings = config.driver_settings(None).unwrap();
        assert_eq!(settings.security_mode, SecurityMode::None);
        assert!(settings.psk_key.is_none());
    }

    #[test]
    fn test_directory_keeps_unresolvable_device() {
        let file = write_temp(SAMPLE);
        let config = ServiceConfig::from_file(file.path()).unwrap();
        let directory = config.build_directory().unwrap();

        let dev1 = directory.device("dev1").unwrap();
        assert_eq!(dev1.address().unwrap().host(), "10.0.0.7");

        let dev2 = directory.device("dev2").unwrap();
        assert!(dev2.address().is_err());
        assert!(directory.resource("dev2", "temperature").is_some());
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let file = write_temp(
            r#"
[[devices]]
name = "dev1"
profile = "missing"
"#,
        );
        assert!(matches!(
            ServiceConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ServiceConfig::from_file(dir.path().join("nope.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_security_mode_is_exact_match() {
        for mode in ["psk", "NOSEC", "none", ""] {
            assert!(
                driver_only(mode, "c2VjcmV0").driver_settings(None).is_err(),
                "mode {:?}",
                mode
            );
        }
    }

    #[test]
    fn test_psk_without_key_fails() {
        assert!(matches!(
            driver_only("PSK", "").driver_settings(None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_psk_key_not_base64_fails() {
        assert!(matches!(
            driver_only("PSK", "not base64!").driver_settings(None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_secret_store_wins() {
        let file = write_temp("[psk]\nPskKey = \"b3RoZXI=\"\n");
        let secrets = Secrets::from_file(file.path()).unwrap();
        let settings = driver_only("PSK", "c2VjcmV0")
            .driver_settings(Some(&secrets))
            .unwrap();
        assert_eq!(settings.psk_key.as_deref(), Some(&b"other"[..]));
    }

    #[test]
    fn test_secret_store_alone_is_enough() {
        let secrets = Secrets {
            psk: Some(PskSecret {
                psk_key: "c2VjcmV0".to_string(),
            }),
        };
        let settings = driver_only("PSK", "").driver_settings(Some(&secrets)).unwrap();
        assert_eq!(settings.psk_key.as_deref(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_server_config_carries_settings() {
        let settings = driver_only("NoSec", "").driver_settings(None).unwrap();
        let server = settings.server_config(Some(0));
        assert_eq!(server.bind_addr, "0.0.0.0");
        assert_eq!(server.security_mode, SecurityMode::None);
        assert_eq!(server.port, Some(0));
    }
}
