//! File push over Bluetooth OBEX
//!
//! Delegates to the `bt-obex` tool from bluez-tools, which handles the OBEX
//! Object Push session itself.

use async_trait::async_trait;
use std::path::Path;
use synchrony_protocol::sinks::FileSender;
use synchrony_protocol::{ProtocolError, Result};
use tokio::process::Command;
use tracing::debug;

const BT_OBEX: &str = "bt-obex";

pub struct ObexFileSender {
    program: String,
}

impl ObexFileSender {
    pub fn new() -> Self {
        Self::with_program(BT_OBEX)
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ObexFileSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSender for ObexFileSender {
    async fn send_file(&self, device_address: &str, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(ProtocolError::InvalidState(format!(
                "{} is not a file",
                path.display()
            )));
        }

        debug!("{} -p {} {}", self.program, device_address, path.display());

        let output = Command::new(&self.program)
            .arg("-p")
            .arg(device_address)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("spawning {}", self.program)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProtocolError::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
