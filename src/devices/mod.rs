//! Blind fleet: the static registry and access to the physical devices
//!
//! ```text
//! devices/
//! ├── mod.rs     - Device, DeviceRegistry, DeviceError
//! ├── driver.rs  - DeviceDriver seam and the simulated driver
//! └── proxy.rs   - DeviceProxy, bounded and serialized driver access
//! ```

pub mod driver;
pub mod proxy;

use crate::config::{BlindConfig, ConfigError};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

pub use driver::{BlindHandle, BlindState, DeviceDriver, DriverError, SimulatedDriver};
pub use proxy::{DeviceProxy, ProxySettings};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown device: {0}")]
    NotFound(String),

    #[error("device {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("invalid position {0}, expected 0-100")]
    InvalidPosition(u8),
}

/// One configured blind. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub address: String,
    pub location: String,
    pub name: String,
    pub writable: bool,
}

impl Device {
    fn from_config(blind: &BlindConfig) -> Self {
        Self {
            id: blind.id.clone(),
            address: blind.address.clone(),
            location: blind.location.clone(),
            name: blind
                .name
                .clone()
                .unwrap_or_else(|| format!("{} Blind", blind.location)),
            writable: !blind.read_only,
        }
    }
}

/// Ids end up as MQTT topic levels and Home Assistant object ids
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Fixed, ordered set of blinds built once from configuration
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn from_config(blinds: &[BlindConfig]) -> Result<Self, ConfigError> {
        let mut devices = Vec::with_capacity(blinds.len());
        let mut index = HashMap::with_capacity(blinds.len());
        let mut addresses: HashMap<String, String> = HashMap::new();

        for blind in blinds {
            if !is_valid_device_id(&blind.id) {
                return Err(ConfigError::InvalidDeviceId(blind.id.clone()));
            }
            if index.contains_key(&blind.id) {
                return Err(ConfigError::DuplicateDevice(blind.id.clone()));
            }
            let address = blind.address.trim().to_ascii_uppercase();
            if address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "blind {:?} has an empty address",
                    blind.id
                )));
            }
            if let Some(first) = addresses.insert(address.clone(), blind.id.clone()) {
                return Err(ConfigError::DuplicateAddress {
                    address,
                    first,
                    second: blind.id.clone(),
                });
            }

            let device = Device::from_config(blind);
            debug!(device = %device.id, address = %device.address, "Registered blind");
            index.insert(device.id.clone(), devices.len());
            devices.push(device);
        }

        info!("Device registry holds {} blinds", devices.len());
        Ok(Self { devices, index })
    }

    /// Devices in configuration order
    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    pub fn lookup(&self, id: &str) -> Result<&Device, DeviceError> {
        self.index
            .get(id)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_blind(id: &str, address: &str, location: &str) -> BlindConfig {
    BlindConfig {
        id: id.to_string(),
        address: address.to_string(),
        location: location.to_string(),
        name: None,
        read_only: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_blind as blind;

    #[test]
    fn keeps_configuration_order() {
        let registry = DeviceRegistry::from_config(&[
            blind("window2", "AA:00", "Bedroom"),
            blind("window1", "AA:01", "Living Room"),
            blind("door", "AA:02", "Hall"),
        ])
        .unwrap();

        let ids: Vec<_> = registry.all().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["window2", "window1", "door"]);
        // stable across calls
        assert_eq!(registry.all(), registry.all());
    }

    #[test]
    fn lookup_finds_devices() {
        let registry =
            DeviceRegistry::from_config(&[blind("window1", "AA:01", "Living Room")]).unwrap();

        let device = registry.lookup("window1").unwrap();
        assert_eq!(device.address, "AA:01");
        assert_eq!(device.name, "Living Room Blind");
        assert!(device.writable);
        assert_eq!(
            registry.lookup("window9"),
            Err(DeviceError::NotFound("window9".into()))
        );
    }

    #[test]
    fn read_only_and_named_blinds() {
        let mut config = blind("skylight", "AA:03", "Attic");
        config.read_only = true;
        config.name = Some("Skylight".into());

        let registry = DeviceRegistry::from_config(&[config]).unwrap();
        let device = registry.lookup("skylight").unwrap();
        assert!(!device.writable);
        assert_eq!(device.name, "Skylight");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = DeviceRegistry::from_config(&[
            blind("window1", "AA:01", "Living Room"),
            blind("window1", "AA:02", "Kitchen"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice(id) if id == "window1"));
    }

    #[test]
    fn duplicate_addresses_are_rejected_case_insensitively() {
        let err = DeviceRegistry::from_config(&[
            blind("window1", "aa:bb:cc:dd:ee:ff", "Living Room"),
            blind("window2", "AA:BB:CC:DD:EE:FF", "Kitchen"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateAddress { first, second, .. } if first == "window1" && second == "window2"
        ));
    }

    #[test]
    fn ids_that_break_topics_are_rejected() {
        for id in ["", "living room", "a/b", "a+", "#", "ümlaut"] {
            let err = DeviceRegistry::from_config(&[blind(id, "AA:01", "X")]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDeviceId(_)), "{id:?} accepted");
        }
    }
}
