//! Bluetooth RFCOMM connector
//!
//! Opens an RFCOMM stream to a paired phone through BlueZ using `bluer`.
//! Pairing and SDP negotiation are left to the system; the phone app
//! listens on a fixed channel.

use super::{ConnectionEndpoint, Connector, DeviceDescriptor};
use crate::channel::BoxedStream;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::Address;
use std::str::FromStr;
use tracing::{debug, info};

/// Connects to [`ConnectionEndpoint::Rfcomm`] endpoints
#[derive(Debug, Default, Clone, Copy)]
pub struct RfcommConnector;

#[async_trait]
impl Connector for RfcommConnector {
    async fn connect(&self, device: &DeviceDescriptor) -> Result<BoxedStream> {
        let ConnectionEndpoint::Rfcomm { address, channel } = &device.endpoint else {
            return Err(ProtocolError::Transport(format!(
                "{} is not an RFCOMM endpoint",
                device.endpoint
            )));
        };

        let bt_addr = Address::from_str(address).map_err(|e| {
            ProtocolError::Configuration(format!(
                "Invalid Bluetooth address '{}': {}",
                address, e
            ))
        })?;

        debug!("Connecting to RFCOMM socket: {} channel {}", bt_addr, channel);

        let stream = Stream::connect(SocketAddr::new(bt_addr, *channel))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connecting to {}", address)))?;

        info!("Connected to {} over RFCOMM", device);
        Ok(Box::new(stream))
    }
}
