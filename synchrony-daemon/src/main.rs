mod clipboard;
mod config;
mod diagnostics;
mod notifications;
mod obex;

use anyhow::{Context, Result};
use clap::Parser;
use diagnostics::{handle_diagnostic_command, Cli};
use std::sync::Arc;
use synchrony_protocol::sinks::{NoopSink, Notifier, Sinks};
use synchrony_protocol::store::SqliteStoreFactory;
use synchrony_protocol::{
    DefaultConnector, DeviceDiscovery, SessionServices, StaticDiscovery, Supervisor,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use clipboard::SystemClipboard;
use config::Config;
use notifications::DesktopNotifier;
use obex::ObexFileSender;

/// Desktop side effects, degrading to no-ops where the desktop lacks them
async fn desktop_sinks() -> Sinks {
    let notifier: Arc<dyn Notifier> = match DesktopNotifier::new().await {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("Desktop notifications unavailable: {:#}", e);
            Arc::new(NoopSink)
        }
    };

    Sinks {
        clipboard: Arc::new(SystemClipboard::new()),
        notifier,
        file_sender: Arc::new(ObexFileSender::new()),
    }
}

#[cfg(feature = "bluetooth")]
async fn build_discovery(config: &Config) -> Result<Arc<dyn DeviceDiscovery>> {
    if !config.discovery.devices.is_empty() {
        info!(
            "Using {} configured devices instead of Bluetooth discovery",
            config.discovery.devices.len()
        );
        return Ok(Arc::new(StaticDiscovery::new(config.static_devices())));
    }

    let discovery = synchrony_protocol::BluezDiscovery::new()
        .await
        .context("Failed to open BlueZ session")?;
    Ok(Arc::new(discovery))
}

#[cfg(not(feature = "bluetooth"))]
async fn build_discovery(config: &Config) -> Result<Arc<dyn DeviceDiscovery>> {
    if config.discovery.devices.is_empty() {
        warn!("Built without Bluetooth and no devices configured; nothing to sync");
    }
    Ok(Arc::new(StaticDiscovery::new(config.static_devices())))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle diagnostic commands (non-daemon mode)
    if let Some(command) = &cli.command {
        return handle_diagnostic_command(&cli, command);
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting Synchrony daemon...");

    let config_path = cli.config_path();
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    config
        .ensure_directories()
        .context("Failed to prepare data directory")?;

    info!("Configuration loaded from {}", config_path.display());
    info!("Data directory: {}", config.paths.data_dir.display());

    let discovery = build_discovery(&config).await?;
    let stores = Arc::new(SqliteStoreFactory::new(config.paths.data_dir.clone()));
    let services = SessionServices {
        connector: Arc::new(DefaultConnector),
        sinks: desktop_sinks().await,
    };

    let relay = if config.relay.enabled {
        let listener = TcpListener::bind(config.relay.bind)
            .await
            .with_context(|| format!("Failed to bind relay on {}", config.relay.bind))?;
        Some(listener)
    } else {
        info!("Relay disabled");
        None
    };

    let supervisor = Supervisor::new(discovery, stores, services, config.supervisor_config());
    let handle = supervisor.spawn(relay);

    info!("Synchrony daemon running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    handle.shutdown().await;

    Ok(())
}
