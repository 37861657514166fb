//! Desktop Notifications
//!
//! Shows notifications forwarded from phones through the freedesktop.org
//! notification service on the session bus.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use synchrony_protocol::models::Notification;
use synchrony_protocol::sinks::Notifier;
use synchrony_protocol::ProtocolError;
use tracing::debug;
use zbus::zvariant::Value;
use zbus::Connection;

/// freedesktop "normal" urgency
const URGENCY_NORMAL: u8 = 1;

/// Builder for one `Notify` call
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    app_name: String,
    summary: String,
    body: String,
    icon: String,
    timeout: i32,
}

impl NotificationBuilder {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            app_name: "Synchrony".to_string(),
            summary: summary.into(),
            body: String::new(),
            icon: "phone-symbolic".to_string(),
            timeout: 10000,
        }
    }

    /// Name the sending phone in the application field
    pub fn app_name(mut self, device_name: &str) -> Self {
        self.app_name = format!("Synchrony ({})", device_name);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    /// Expiry in milliseconds; -1 lets the server decide
    pub fn timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout = timeout_ms;
        self
    }

    fn build(self) -> NotificationParams {
        let mut hints = HashMap::new();
        hints.insert("urgency".to_string(), Value::U8(URGENCY_NORMAL));

        NotificationParams {
            app_name: self.app_name,
            replaces_id: 0,
            icon: self.icon,
            summary: self.summary,
            body: self.body,
            actions: Vec::new(),
            hints,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug)]
struct NotificationParams {
    app_name: String,
    replaces_id: u32,
    icon: String,
    summary: String,
    body: String,
    actions: Vec<String>,
    hints: HashMap<String, Value<'static>>,
    timeout: i32,
}

/// Builder for a phone notification
pub fn phone_notification(device_name: &str, notification: &Notification) -> NotificationBuilder {
    NotificationBuilder::new(notification.summary())
        .body(notification.body())
        .icon("phone-symbolic")
        .timeout(10000)
        .app_name(device_name)
}

/// Client for org.freedesktop.Notifications
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    connection: Connection,
}

impl DesktopNotifier {
    /// Connect to the session bus
    pub async fn new() -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to session DBus")?;

        debug!("Connected to notifications service");

        Ok(Self { connection })
    }

    /// Send a notification and return its server id
    pub async fn send(&self, builder: NotificationBuilder) -> Result<u32> {
        let params = builder.build();

        let proxy = zbus::Proxy::new(
            &self.connection,
            "org.freedesktop.Notifications",
            "/org/freedesktop/Notifications",
            "org.freedesktop.Notifications",
        )
        .await
        .context("Failed to create notifications proxy")?;

        let notification_id: u32 = proxy
            .call_method(
                "Notify",
                &(
                    &params.app_name,
                    params.replaces_id,
                    &params.icon,
                    &params.summary,
                    &params.body,
                    &params.actions,
                    &params.hints,
                    params.timeout,
                ),
            )
            .await
            .context("Failed to send notification")?
            .body()
            .deserialize()
            .context("Failed to parse notification ID")?;

        debug!(
            "Sent notification '{}' with ID {}",
            params.summary, notification_id
        );

        Ok(notification_id)
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(
        &self,
        device_name: &str,
        notification: &Notification,
    ) -> synchrony_protocol::Result<()> {
        self.send(phone_notification(device_name, notification))
            .await
            .map(|_| ())
            .map_err(|e| ProtocolError::Io(std::io::Error::other(format!("{:#}", e))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_builder() {
        let params = NotificationBuilder::new("Test Summary")
            .body("Test body")
            .icon("test-icon")
            .timeout(1000)
            .build();

        assert_eq!(params.summary, "Test Summary");
        assert_eq!(params.body, "Test body");
        assert_eq!(params.icon, "test-icon");
        assert_eq!(params.timeout, 1000);
        assert_eq!(params.hints.get("urgency"), Some(&Value::U8(1)));
        assert!(params.actions.is_empty());
    }

    #[test]
    fn test_phone_notification_text() {
        let notification: Notification =
            serde_json::from_str(r#"{"appName":"Signal","title":"Bob","text":"hey"}"#).unwrap();
        let params = phone_notification("Pixel", &notification).build();

        assert_eq!(params.summary, "Signal: Bob");
        assert_eq!(params.body, "hey");
        assert_eq!(params.app_name, "Synchrony (Pixel)");
    }

    #[test]
    fn test_phone_notification_fallbacks() {
        let notification: Notification = serde_json::from_str("{}").unwrap();
        let params = phone_notification("Pixel", &notification).build();

        assert_eq!(params.summary, "No Title");
        assert_eq!(params.body, "No Description");
    }
}
