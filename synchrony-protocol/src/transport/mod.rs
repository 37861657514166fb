//! Synchrony Transport Layer
//!
//! A session only needs an already-connected duplex byte stream. This module
//! describes where a device can be reached and turns that description into a
//! stream.
//!
//! - [`TcpConnector`] for devices bridged over TCP (emulators, test rigs)
//! - `RfcommConnector` for Bluetooth phones, behind the `bluetooth` feature
//! - [`DefaultConnector`] picks one of the two per [`ConnectionEndpoint`]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;

#[cfg(feature = "bluetooth")]
pub use bluetooth::RfcommConnector;

use crate::channel::BoxedStream;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// RFCOMM channel the phone app listens on
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 8;

/// Where a device's byte stream can be opened
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionEndpoint {
    Tcp(SocketAddr),
    Rfcomm { address: String, channel: u8 },
}

impl fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            ConnectionEndpoint::Rfcomm { address, channel } => {
                write!(f, "rfcomm://{}/{}", address, channel)
            }
        }
    }
}

/// A compatible device the supervisor tracks
///
/// `address` is the identity key: one session per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
    pub endpoint: ConnectionEndpoint,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        endpoint: ConnectionEndpoint,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            endpoint,
        }
    }

    /// Bluetooth device on the default RFCOMM channel
    pub fn rfcomm(name: impl Into<String>, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: name.into(),
            endpoint: ConnectionEndpoint::Rfcomm {
                address: address.clone(),
                channel: DEFAULT_RFCOMM_CHANNEL,
            },
            address,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Opens a byte stream to a device
///
/// Implementations should not apply their own timeout; the session bounds
/// every attempt with its connect timeout.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceDescriptor) -> Result<BoxedStream>;
}

/// Connects to [`ConnectionEndpoint::Tcp`] endpoints
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, device: &DeviceDescriptor) -> Result<BoxedStream> {
        let ConnectionEndpoint::Tcp(addr) = &device.endpoint else {
            return Err(ProtocolError::Transport(format!(
                "{} is not a TCP endpoint",
                device.endpoint
            )));
        };

        debug!("Connecting to {} over TCP at {}", device.name, addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connecting to {}", addr)))?;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}

/// Dispatches on the endpoint kind
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, device: &DeviceDescriptor) -> Result<BoxedStream> {
        match &device.endpoint {
            ConnectionEndpoint::Tcp(_) => TcpConnector.connect(device).await,
            #[cfg(feature = "bluetooth")]
            ConnectionEndpoint::Rfcomm { .. } => RfcommConnector.connect(device).await,
            #[cfg(not(feature = "bluetooth"))]
            ConnectionEndpoint::Rfcomm { .. } => Err(ProtocolError::Transport(format!(
                "cannot reach {}: built without bluetooth support",
                device.endpoint
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = DeviceDescriptor::new("Emulator", "emu-1", ConnectionEndpoint::Tcp(addr));

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = DefaultConnector.connect(&device).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_tcp_connector_rejects_rfcomm() {
        let device = DeviceDescriptor::rfcomm("Pixel", "AA:BB:CC:DD:EE:FF");
        let err = TcpConnector.connect(&device).await.err().unwrap();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let device = DeviceDescriptor::new("Gone", "gone", ConnectionEndpoint::Tcp(addr));

        let err = TcpConnector.connect(&device).await.err().unwrap();
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_display() {
        let device = DeviceDescriptor::rfcomm("Pixel", "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.to_string(), "Pixel (AA:BB:CC:DD:EE:FF)");
        assert_eq!(
            device.endpoint.to_string(),
            "rfcomm://AA:BB:CC:DD:EE:FF/8"
        );
    }
}
