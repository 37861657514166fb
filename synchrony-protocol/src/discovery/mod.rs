//! Device Discovery
//!
//! The supervisor asks a [`DeviceDiscovery`] implementation which devices are
//! currently reachable, once per poll interval. A device is tracked only if
//! it advertises the Generic Telephony service class (`0x1204`), which is
//! how phones are told apart from headsets and keyboards.

#[cfg(feature = "bluetooth")]
pub mod bluetooth;

#[cfg(feature = "bluetooth")]
pub use bluetooth::BluezDiscovery;

use crate::transport::{ConnectionEndpoint, DeviceDescriptor};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Generic Telephony service class, short form
pub const GENERIC_TELEPHONY_CLASS: &str = "1204";

/// One advertised service of a discovered device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: Option<String>,
    /// Service class ids, short form where one exists (`"1204"`)
    pub service_classes: Vec<String>,
}

impl ServiceDescriptor {
    pub fn with_classes<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            service_classes: classes.into_iter().map(Into::into).collect(),
        }
    }
}

/// A device as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub services: Vec<ServiceDescriptor>,
    /// Explicit endpoint; `None` means RFCOMM on the configured channel
    pub endpoint: Option<ConnectionEndpoint>,
}

impl DiscoveredDevice {
    /// Whether any service is a telephony service
    pub fn is_compatible(&self) -> bool {
        self.services.iter().any(|service| {
            service
                .service_classes
                .iter()
                .any(|class| normalize_class(class) == GENERIC_TELEPHONY_CLASS)
        })
    }

    /// Build the descriptor a session is created from
    pub fn descriptor(&self, rfcomm_channel: u8) -> DeviceDescriptor {
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| ConnectionEndpoint::Rfcomm {
                address: self.address.clone(),
                channel: rfcomm_channel,
            });

        DeviceDescriptor::new(self.name.clone(), self.address.clone(), endpoint)
    }
}

/// Strip `0x` and case so `"0x1204"` and `"1204"` compare equal
fn normalize_class(class: &str) -> String {
    let class = class.trim();
    class
        .strip_prefix("0x")
        .or_else(|| class.strip_prefix("0X"))
        .unwrap_or(class)
        .to_ascii_uppercase()
}

/// Source of currently reachable devices
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>>;
}

/// Discovery backed by a list the caller maintains
///
/// Clones share the same list, so a test (or a config reload) can add and
/// remove devices while the supervisor polls.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    devices: Arc<RwLock<Vec<DiscoveredDevice>>>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self {
            devices: Arc::new(RwLock::new(devices)),
        }
    }

    /// Add a device, replacing any with the same address
    pub fn add(&self, device: DiscoveredDevice) {
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        devices.retain(|d| d.address != device.address);
        devices.push(device);
    }

    pub fn remove(&self, address: &str) {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|d| d.address != address);
    }

    pub fn set(&self, devices: Vec<DiscoveredDevice>) {
        *self
            .devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = devices;
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, classes: &[&str]) -> DiscoveredDevice {
        DiscoveredDevice {
            name: "Phone".into(),
            address: address.into(),
            services: vec![ServiceDescriptor::with_classes(classes.iter().copied())],
            endpoint: None,
        }
    }

    #[test]
    fn test_compatibility_predicate() {
        assert!(device("A", &["110A", "1204"]).is_compatible());
        assert!(device("A", &["0x1204"]).is_compatible());
        assert!(!device("A", &["110B", "111E"]).is_compatible());

        let mut no_services = device("A", &[]);
        no_services.services.clear();
        assert!(!no_services.is_compatible());
    }

    #[test]
    fn test_descriptor_defaults_to_rfcomm() {
        let descriptor = device("AA:BB", &["1204"]).descriptor(8);
        assert_eq!(
            descriptor.endpoint,
            ConnectionEndpoint::Rfcomm {
                address: "AA:BB".into(),
                channel: 8
            }
        );
    }

    #[tokio::test]
    async fn test_static_discovery_is_shared() {
        let discovery = StaticDiscovery::default();
        let handle = discovery.clone();

        handle.add(device("A", &["1204"]));
        handle.add(device("B", &["1204"]));
        handle.add(device("A", &["1204"]));
        assert_eq!(discovery.discover().await.unwrap().len(), 2);

        handle.remove("A");
        let remaining = discovery.discover().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, "B");
    }
}
