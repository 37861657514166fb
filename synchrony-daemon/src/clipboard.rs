//! System clipboard sink backed by `arboard`

use arboard::Clipboard;
use std::sync::Mutex;
use synchrony_protocol::sinks::ClipboardSink;
use synchrony_protocol::{ProtocolError, Result};
use tracing::debug;

/// Puts text received from phones on the desktop clipboard
///
/// The handle is opened on first use and kept open; on X11 the contents live
/// only as long as the handle that set them.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Mutex<Option<Clipboard>>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

fn clipboard_error(e: arboard::Error) -> ProtocolError {
    ProtocolError::Io(std::io::Error::other(e))
}

impl ClipboardSink for SystemClipboard {
    fn set_text(&self, text: &str) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.is_none() {
            *guard = Some(Clipboard::new().map_err(clipboard_error)?);
        }

        if let Some(clipboard) = guard.as_mut() {
            if let Err(e) = clipboard.set_text(text.to_owned()) {
                // Reopened on the next call
                *guard = None;
                return Err(clipboard_error(e));
            }
        }

        debug!("Clipboard set ({} bytes)", text.len());
        Ok(())
    }
}
