//! Daemon CLI Tests
//!
//! Runs the built binary's diagnostic subcommands against a throwaway
//! configuration file.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn daemon() -> Command {
    Command::new(env!("CARGO_BIN_EXE_synchrony-daemon"))
}

/// `dump-config` writes the default file and prints it
#[test]
fn test_dump_config_creates_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.toml");

    let output = daemon()
        .arg("--config")
        .arg(&path)
        .arg("dump-config")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(path.exists());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("[session]"));
    assert!(stdout.contains("activity_timeout_secs = 10"));
    assert!(stdout.contains("bind = \"127.0.0.1:5100\""));
}

/// `list-devices` reports configured phones and their endpoints
#[test]
fn test_list_devices() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.toml");
    fs::write(
        &path,
        r#"
[[discovery.devices]]
name = "Pixel"
address = "AA:BB:CC:DD:EE:FF"
tcp = "127.0.0.1:6000"
"#,
    )
    .unwrap();

    let output = daemon()
        .arg("--config")
        .arg(&path)
        .arg("list-devices")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Pixel (AA:BB:CC:DD:EE:FF) via tcp://127.0.0.1:6000"));
    assert!(stdout.contains("Total: 1 devices"));
}

/// A malformed file is reported instead of being overwritten
#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.toml");
    fs::write(&path, "[session\n").unwrap();

    let output = daemon()
        .arg("--config")
        .arg(&path)
        .arg("dump-config")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert_eq!(fs::read_to_string(&path).unwrap(), "[session\n");
}
