//! BlueZ discovery
//!
//! Reports every Bluetooth device BlueZ currently shows as connected, with
//! its advertised service UUIDs converted to short service class ids.

use super::{DeviceDiscovery, DiscoveredDevice, ServiceDescriptor};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use bluer::{Session, Uuid};
use tracing::{debug, warn};

/// Suffix shared by every UUID derived from a 16-bit Bluetooth id
const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

pub struct BluezDiscovery {
    session: Session,
}

impl BluezDiscovery {
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?;
        Ok(Self { session })
    }
}

/// `00001204-0000-1000-8000-00805f9b34fb` becomes `1204`
fn service_class(uuid: &Uuid) -> String {
    let text = uuid.to_string();
    match text.strip_suffix(BLUETOOTH_BASE_SUFFIX) {
        Some(head) if head.starts_with("0000") => head[4..].to_ascii_uppercase(),
        _ => text,
    }
}

#[async_trait]
impl DeviceDiscovery for BluezDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let adapter = self
            .session
            .default_adapter()
            .await
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?;

        let addresses = adapter
            .device_addresses()
            .await
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?;

        let mut found = Vec::new();
        for addr in addresses {
            let device = match adapter.device(addr) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Skipping device {}: {}", addr, e);
                    continue;
                }
            };

            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }

            let name = device
                .name()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| addr.to_string());
            let classes = device
                .uuids()
                .await
                .ok()
                .flatten()
                .unwrap_or_default()
                .iter()
                .map(service_class)
                .collect::<Vec<_>>();

            debug!("Connected device {} ({}) classes {:?}", name, addr, classes);

            found.push(DiscoveredDevice {
                name,
                address: addr.to_string(),
                services: vec![ServiceDescriptor {
                    name: None,
                    service_classes: classes,
                }],
                endpoint: None,
            });
        }

        Ok(found)
    }
}
