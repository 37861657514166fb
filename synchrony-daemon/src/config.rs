//! Daemon Configuration
//!
//! TOML configuration for the Synchrony daemon, loaded from
//! `~/.config/synchrony/daemon.toml` unless another path is given.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use synchrony_protocol::discovery::GENERIC_TELEPHONY_CLASS;
use synchrony_protocol::relay::DEFAULT_PROBE_INTERVAL;
use synchrony_protocol::session::{
    DEFAULT_ACTIVITY_TIMEOUT, DEFAULT_CHUNK_TTL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_TIMEOUT,
    DEFAULT_RECONNECT_BACKOFF,
};
use synchrony_protocol::supervisor::DEFAULT_POLL_INTERVAL;
use synchrony_protocol::transport::DEFAULT_RFCOMM_CHANNEL;
use synchrony_protocol::{
    ConnectionEndpoint, DiscoveredDevice, ServiceDescriptor, SessionConfig, SupervisorConfig,
    DEFAULT_MAX_FRAME_BYTES, DEFAULT_RELAY_PORT,
};

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Per-device session timing
    #[serde(default)]
    pub session: SessionSection,

    /// Device discovery
    #[serde(default)]
    pub discovery: DiscoverySection,

    /// Link to the presentation process
    #[serde(default)]
    pub relay: RelaySection,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    /// How long one read waits before the session checks its timers
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Silence after which a connection is dropped
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,

    /// Pause between reconnect attempts
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest record accepted from a device
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Idle photo transfers are dropped after this long (0 = never)
    #[serde(default = "default_chunk_ttl_secs")]
    pub chunk_ttl_secs: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// RFCOMM channel the phone app listens on
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,

    /// Devices to track without Bluetooth discovery
    ///
    /// Entries with a `tcp` address are reached over TCP; the rest over
    /// RFCOMM on `rfcomm_channel`.
    #[serde(default)]
    pub devices: Vec<StaticDevice>,
}

/// A device listed in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDevice {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<SocketAddr>,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address the presentation process connects to
    #[serde(default = "default_relay_bind")]
    pub bind: SocketAddr,

    /// Idle time before the peer is sent a connection test
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

/// Storage paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Root of the per-phone record databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT.as_millis() as u64
}

fn default_activity_timeout_secs() -> u64 {
    DEFAULT_ACTIVITY_TIMEOUT.as_secs()
}

fn default_reconnect_backoff_secs() -> u64 {
    DEFAULT_RECONNECT_BACKOFF.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_chunk_ttl_secs() -> u64 {
    DEFAULT_CHUNK_TTL.as_secs()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_rfcomm_channel() -> u8 {
    DEFAULT_RFCOMM_CHANNEL
}

fn default_true() -> bool {
    true
}

fn default_relay_bind() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_RELAY_PORT))
}

fn default_probe_interval_secs() -> u64 {
    DEFAULT_PROBE_INTERVAL.as_secs()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("synchrony")
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            activity_timeout_secs: default_activity_timeout_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            chunk_ttl_secs: default_chunk_ttl_secs(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            rfcomm_channel: default_rfcomm_channel(),
            devices: Vec::new(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_relay_bind(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl SessionSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            activity_timeout: Duration::from_secs(self.activity_timeout_secs),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_frame_bytes: self.max_frame_bytes,
            chunk_ttl: Duration::from_secs(self.chunk_ttl_secs),
        }
    }
}

impl StaticDevice {
    /// Configured devices are assumed to run the phone app
    pub fn to_discovered(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            name: self.name.clone(),
            address: self.address.clone(),
            services: vec![ServiceDescriptor::with_classes([GENERIC_TELEPHONY_CLASS])],
            endpoint: self.tcp.map(ConnectionEndpoint::Tcp),
        }
    }
}

impl Config {
    /// `~/.config/synchrony/daemon.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("synchrony")
            .join("daemon.toml")
    }

    /// Load from `path`, writing the defaults there first if it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(self.discovery.poll_interval_ms),
            rfcomm_channel: self.discovery.rfcomm_channel,
            probe_interval: Duration::from_secs(self.relay.probe_interval_secs),
            session: self.session.to_session_config(),
        }
    }

    pub fn static_devices(&self) -> Vec<DiscoveredDevice> {
        self.discovery
            .devices
            .iter()
            .map(StaticDevice::to_discovered)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.activity_timeout_secs, 10);
        assert_eq!(config.session.reconnect_backoff_secs, 5);
        assert_eq!(config.session.chunk_ttl_secs, 300);
        assert_eq!(config.discovery.poll_interval_ms, 500);
        assert_eq!(config.discovery.rfcomm_channel, 8);
        assert_eq!(config.relay.bind.to_string(), "127.0.0.1:5100");
        assert!(config.relay.enabled);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.discovery.devices.push(StaticDevice {
            name: "Pixel".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            tcp: Some("192.168.1.20:5200".parse().unwrap()),
        });

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [session]
            activity_timeout_secs = 30

            [[discovery.devices]]
            name = "Phone"
            address = "11:22:33:44:55:66"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.session.activity_timeout_secs, 30);
        assert_eq!(parsed.session.reconnect_backoff_secs, 5);
        assert_eq!(parsed.discovery.rfcomm_channel, 8);
        assert_eq!(parsed.discovery.devices.len(), 1);
        assert!(parsed.discovery.devices[0].tcp.is_none());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("synchrony").join("daemon.toml");

        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_supervisor_config_conversion() {
        let mut config = Config::default();
        config.session.chunk_ttl_secs = 0;
        config.relay.probe_interval_secs = 3;

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.poll_interval, Duration::from_millis(500));
        assert_eq!(supervisor.probe_interval, Duration::from_secs(3));
        assert_eq!(supervisor.session.chunk_ttl, Duration::ZERO);
        assert_eq!(supervisor.session.activity_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_static_devices_are_compatible() {
        let mut config = Config::default();
        config.discovery.devices = vec![
            StaticDevice {
                name: "Bt".into(),
                address: "AA".into(),
                tcp: None,
            },
            StaticDevice {
                name: "Net".into(),
                address: "BB".into(),
                tcp: Some("127.0.0.1:6000".parse().unwrap()),
            },
        ];

        let devices = config.static_devices();
        assert!(devices.iter().all(DiscoveredDevice::is_compatible));
        assert_eq!(devices[0].descriptor(8).endpoint.to_string(), "rfcomm://AA/8");
        assert_eq!(devices[1].descriptor(8).endpoint.to_string(), "tcp://127.0.0.1:6000");
    }
}
