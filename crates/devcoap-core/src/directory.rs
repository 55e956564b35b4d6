//! Device and resource directory
//!
//! The directory maps device names to their profiles and cached transport
//! address. Lookups hand out `Arc` records; dropping the `Arc` releases the
//! record, so every exit path of a caller releases what it resolved.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::{EndDeviceAddress, Protocols};
use crate::{Error, ResourceType, Result, PROTOCOL_NAME};

/// A resource a device exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub value_type: ResourceType,
    /// Media type from the profile, informational only
    #[serde(default)]
    pub media_type: Option<String>,
}

impl ResourceRecord {
    pub fn new(name: impl Into<String>, value_type: impl Into<ResourceType>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
            media_type: None,
        }
    }
}

/// A named set of resources shared by devices of the same kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: ResourceRecord) -> Self {
        self.resources.push(resource);
        self
    }
}

/// A registered device
#[derive(Debug)]
pub struct DeviceRecord {
    pub name: String,
    profiles: Vec<Arc<DeviceProfile>>,
    protocols: Protocols,
    address: std::result::Result<EndDeviceAddress, Error>,
}

impl DeviceRecord {
    /// Build a record, resolving the `COAP` protocol block once.
    pub fn new(name: impl Into<String>, profiles: Vec<Arc<DeviceProfile>>, protocols: Protocols) -> Self {
        let name = name.into();
        let address = EndDeviceAddress::from_protocols(&protocols, PROTOCOL_NAME);
        if let Err(e) = &address {
            warn!("Device {}: protocol property for device is invalid: {}", name, e);
        }
        Self {
            name,
            profiles,
            protocols,
            address,
        }
    }

    /// The cached transport address, or the reason it could not be built
    pub fn address(&self) -> Result<&EndDeviceAddress> {
        self.address.as_ref().map_err(Clone::clone)
    }

    pub fn protocols(&self) -> &Protocols {
        &self.protocols
    }

    pub fn profiles(&self) -> &[Arc<DeviceProfile>] {
        &self.profiles
    }

    /// Find a resource by exact name. Profiles are searched in order and the
    /// first match wins.
    pub fn resource(&self, name: &str) -> Option<&ResourceRecord> {
        self.profiles
            .iter()
            .flat_map(|profile| profile.resources.iter())
            .find(|resource| resource.name == name)
    }

    /// All resources across profiles, in lookup order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.profiles.iter().flat_map(|p| p.resources.iter())
    }
}

/// Read access to devices, shared by the outbound and inbound paths
pub trait Directory: Send + Sync {
    /// Look up a device by name
    fn device(&self, name: &str) -> Option<Arc<DeviceRecord>>;

    /// Look up a resource of a device by name
    fn resource(&self, device: &str, resource: &str) -> Option<ResourceRecord> {
        self.device(device)
            .and_then(|d| d.resource(resource).cloned())
    }
}

/// In-process directory
#[derive(Default)]
pub struct InMemoryDirectory {
    profiles: RwLock<HashMap<String, Arc<DeviceProfile>>>,
    devices: RwLock<HashMap<String, Arc<DeviceRecord>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a profile. Devices already registered keep the
    /// profile they were built with.
    pub fn add_profile(&self, profile: DeviceProfile) {
        debug!("Adding profile {}", profile.name);
        self.profiles
            .write()
            .insert(profile.name.clone(), Arc::new(profile));
    }

    pub fn profile(&self, name: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.read().get(name).cloned()
    }

    /// Register a device against one or more known profiles.
    ///
    /// An unresolvable protocol block does not prevent registration; the
    /// failure is kept with the record and reported when the device is used.
    pub fn add_device(
        &self,
        name: &str,
        profile_names: &[&str],
        protocols: Protocols,
    ) -> Result<Arc<DeviceRecord>> {
        let profiles = {
            let known = self.profiles.read();
            profile_names
                .iter()
                .map(|p| {
                    known.get(*p).cloned().ok_or_else(|| {
                        Error::Configuration(format!("device {}: unknown profile {}", name, p))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let record = Arc::new(DeviceRecord::new(name, profiles, protocols));
        if self
            .devices
            .write()
            .insert(name.to_string(), Arc::clone(&record))
            .is_some()
        {
            info!("Replaced device {}", name);
        } else {
            info!("Added device {}", name);
        }
        Ok(record)
    }

    /// Replace a device's protocol blocks, rebuilding its cached address.
    pub fn update_protocols(&self, name: &str, protocols: Protocols) -> Result<Arc<DeviceRecord>> {
        let mut devices = self.devices.write();
        let current = devices
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("device {} not registered", name)))?;
        let record = Arc::new(DeviceRecord::new(name, current.profiles.clone(), protocols));
        devices.insert(name.to_string(), Arc::clone(&record));
        debug!("Updated address of device {}", name);
        Ok(record)
    }

    pub fn remove_device(&self, name: &str) -> Option<Arc<DeviceRecord>> {
        let removed = self.devices.write().remove(name);
        if removed.is_some() {
            info!("Removed device {}", name);
        }
        removed
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl Directory for InMemoryDirectory {
    fn device(&self, name: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.read().get(name).cloned()
    }
}

impl<D: Directory + ?Sized> Directory for Arc<D> {
    fn device(&self, name: &str) -> Option<Arc<DeviceRecord>> {
        (**self).device(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ProtocolProperties;

    fn coap(addr: &str) -> Protocols {
        let mut props = ProtocolProperties::new();
        props.insert("ED_ADDR".to_string(), addr.to_string());
        props.insert("ED_SecurityMode".to_string(), "NoSec".to_string());
        let mut protocols = Protocols::new();
        protocols.insert("COAP".to_string(), props);
        protocols
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let dir = InMemoryDirectory::new();
        let err = dir.add_device("d1", &["missing"], coap("127.0.0.1")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_first_profile_wins() {
        let dir = InMemoryDirectory::new();
        dir.add_profile(DeviceProfile::new("a").with_resource(ResourceRecord::new("temp", "Float64")));
        dir.add_profile(DeviceProfile::new("b").with_resource(ResourceRecord::new("temp", "Int32")));
        dir.add_device("d1", &["a", "b"], coap("127.0.0.1")).unwrap();

        let resource = dir.resource("d1", "temp").unwrap();
        assert_eq!(resource.value_type, ResourceType::Float64);
    }

    #[test]
    fn test_invalid_address_kept_with_record() {
        let dir = InMemoryDirectory::new();
        dir.add_profile(DeviceProfile::new("p"));
        let record = dir.add_device("d1", &["p"], Protocols::new()).unwrap();
        assert_eq!(
            record.address().unwrap_err(),
            Error::MissingProtocol("COAP".to_string())
        );
    }

    #[test]
    fn test_update_replaces_address() {
        let dir = InMemoryDirectory::new();
        dir.add_profile(DeviceProfile::new("p"));
        let old = dir.add_device("d1", &["p"], coap("10.0.0.1")).unwrap();
        let new = dir.update_protocols("d1", coap("10.0.0.2")).unwrap();

        assert_eq!(old.address().unwrap().host(), "10.0.0.1");
        assert_eq!(new.address().unwrap().host(), "10.0.0.2");
        assert_eq!(dir.device("d1").unwrap().address().unwrap().host(), "10.0.0.2");
    }
}
