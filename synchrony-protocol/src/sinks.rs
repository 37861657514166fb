//! Desktop collaborators
//!
//! Side effects that leave the engine: putting text on the clipboard,
//! showing a notification, pushing a file to a phone. The daemon provides the
//! real implementations; tests use the recording ones in this module.

use crate::models::Notification;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Receives `incoming_clipboard` text
pub trait ClipboardSink: Send + Sync {
    fn set_text(&self, text: &str) -> Result<()>;
}

/// Shows `incoming_notification` records on the desktop
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, device_name: &str, notification: &Notification) -> Result<()>;
}

/// Pushes a local file to a device out of band
#[async_trait]
pub trait FileSender: Send + Sync {
    async fn send_file(&self, device_address: &str, path: &Path) -> Result<()>;
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct Sinks {
    pub clipboard: Arc<dyn ClipboardSink>,
    pub notifier: Arc<dyn Notifier>,
    pub file_sender: Arc<dyn FileSender>,
}

impl Sinks {
    /// Sinks that discard everything
    pub fn noop() -> Self {
        let noop = Arc::new(NoopSink);
        Self {
            clipboard: noop.clone(),
            notifier: noop.clone(),
            file_sender: noop,
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ClipboardSink for NoopSink {
    fn set_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Notifier for NoopSink {
    async fn notify(&self, _device_name: &str, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FileSender for NoopSink {
    async fn send_file(&self, _device_address: &str, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Records every side effect it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub clipboard: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<(String, String)>>,
    pub files: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Use this sink for all three collaborators
    pub fn sinks(self: &Arc<Self>) -> Sinks {
        Sinks {
            clipboard: self.clone(),
            notifier: self.clone(),
            file_sender: self.clone(),
        }
    }

    pub fn clipboard_texts(&self) -> Vec<String> {
        lock(&self.clipboard).clone()
    }

    /// `(summary, body)` pairs
    pub fn notification_texts(&self) -> Vec<(String, String)> {
        lock(&self.notifications).clone()
    }

    /// `(address, path)` pairs
    pub fn sent_files(&self) -> Vec<(String, String)> {
        lock(&self.files).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ClipboardSink for RecordingSink {
    fn set_text(&self, text: &str) -> Result<()> {
        lock(&self.clipboard).push(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingSink {
    async fn notify(&self, _device_name: &str, notification: &Notification) -> Result<()> {
        lock(&self.notifications).push((notification.summary(), notification.body()));
        Ok(())
    }
}

#[async_trait]
impl FileSender for RecordingSink {
    async fn send_file(&self, device_address: &str, path: &Path) -> Result<()> {
        lock(&self.files).push((device_address.to_string(), path.display().to_string()));
        Ok(())
    }
}
