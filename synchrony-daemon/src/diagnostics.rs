//! Diagnostics and Debug Logging
//!
//! Command-line interface, logging setup and the diagnostic subcommands of
//! the Synchrony daemon.

use crate::config::Config;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Synchrony daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "synchrony-daemon")]
#[command(about = "Keeps the desktop in sync with nearby phones", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.config/synchrony/daemon.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Omit timestamps from logs
    #[arg(long = "no-timestamps", action = ArgAction::SetFalse)]
    pub timestamps: bool,

    /// Diagnostic subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}

/// Diagnostic commands for troubleshooting
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Show the effective configuration
    DumpConfig,

    /// List the devices configured for static discovery
    ListDevices,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Run a diagnostic subcommand and exit
pub fn handle_diagnostic_command(cli: &Cli, command: &DiagnosticCommand) -> Result<()> {
    let path = cli.config_path();
    let config = Config::load(&path).context("Failed to load configuration")?;

    match command {
        DiagnosticCommand::DumpConfig => {
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        DiagnosticCommand::ListDevices => {
            println!("\n=== Configured Devices ===");
            for line in device_lines(&config) {
                println!("{}", line);
            }
            println!("\nTotal: {} devices", config.discovery.devices.len());
        }
    }

    Ok(())
}

fn device_lines(config: &Config) -> Vec<String> {
    config
        .static_devices()
        .iter()
        .map(|device| {
            let endpoint = device.descriptor(config.discovery.rfcomm_channel).endpoint;
            format!("{} ({}) via {}", device.name, device.address, endpoint)
        })
        .collect()
}
