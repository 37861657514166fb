//! Relay Link
//!
//! The presentation process (GUI) connects to the daemon over a local TCP
//! socket and speaks the same delimiter framing as phones. At most one peer
//! is served at a time; a second connection is closed on accept.
//!
//! ## Messages to the peer
//!
//! | keyword | payload |
//! |---|---|
//! | `incoming_phone_data` | `{"name","address","btSocketConnected"}` |
//! | `remove_phone_data` | device address |
//! | `connection_test` | none, sent after an idle probe window |
//!
//! ## Requests from the peer
//!
//! `do_sync`, `send_clipboard`, `send_file`, `send_sms` and `log`; see
//! [`RelayRequest`].

use crate::channel::{ChannelReader, ChannelSender, FramedChannel};
use crate::command::{keywords, CommandRecord};
use crate::session::{SessionEvent, SessionHandle, SessionSnapshot, SessionState};
use crate::sinks::FileSender;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Port the presentation peer connects to
pub const DEFAULT_RELAY_PORT: u16 = 5100;

/// Idle window after which the peer is probed
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Session table shared between the supervisor (writer) and the relay
pub type SessionTable = Arc<RwLock<HashMap<String, SessionHandle>>>;

/// Device summary pushed to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneData {
    pub name: String,
    pub address: String,
    #[serde(rename = "btSocketConnected")]
    pub connected: bool,
}

impl From<&SessionSnapshot> for PhoneData {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            address: snapshot.address.clone(),
            connected: snapshot.state.is_connected(),
        }
    }
}

impl From<&SessionEvent> for PhoneData {
    fn from(event: &SessionEvent) -> Self {
        Self {
            name: event.device.name.clone(),
            address: event.device.address.clone(),
            connected: event.state.is_connected(),
        }
    }
}

/// Device a request is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhoneTarget {
    #[serde(default)]
    pub phone_name: Option<String>,
    pub phone_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct ClipboardRequest {
    clipboard: String,
    #[serde(flatten)]
    target: PhoneTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct FileRequest {
    file_name: PathBuf,
    #[serde(flatten)]
    target: PhoneTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct SmsRequest {
    selected_phone: PhoneTarget,
    number: String,
    message: String,
}

/// Outbound SMS as sent to the phone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsPayload {
    pub number: String,
    pub message: String,
}

/// Level of a forwarded peer log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLogLevel {
    Info,
    Debug,
    Error,
}

/// A request from the presentation peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRequest {
    DoSync(PhoneTarget),
    SendClipboard {
        target: PhoneTarget,
        text: String,
    },
    SendFile {
        target: PhoneTarget,
        path: PathBuf,
    },
    SendSms {
        target: PhoneTarget,
        sms: SmsPayload,
    },
    Log {
        level: PeerLogLevel,
        message: String,
        stacktrace: Option<String>,
    },
}

impl TryFrom<&CommandRecord> for RelayRequest {
    type Error = ProtocolError;

    fn try_from(record: &CommandRecord) -> Result<Self> {
        let request = match record.keyword.as_str() {
            keywords::DO_SYNC => RelayRequest::DoSync(record.json_payload()?),
            keywords::SEND_CLIPBOARD => {
                let req: ClipboardRequest = record.json_payload()?;
                RelayRequest::SendClipboard {
                    target: req.target,
                    text: req.clipboard,
                }
            }
            keywords::SEND_FILE => {
                let req: FileRequest = record.json_payload()?;
                RelayRequest::SendFile {
                    target: req.target,
                    path: req.file_name,
                }
            }
            keywords::SEND_SMS => {
                let req: SmsRequest = record.json_payload()?;
                RelayRequest::SendSms {
                    target: req.selected_phone,
                    sms: SmsPayload {
                        number: req.number,
                        message: req.message,
                    },
                }
            }
            keywords::LOG => {
                let (level, message, stacktrace): (String, String, Option<String>) =
                    record.json_payload()?;
                let level = match level.as_str() {
                    "i" => PeerLogLevel::Info,
                    "d" => PeerLogLevel::Debug,
                    "e" => PeerLogLevel::Error,
                    other => {
                        return Err(ProtocolError::InvalidPacket(format!(
                            "unknown log level '{}'",
                            other
                        )))
                    }
                };
                RelayRequest::Log {
                    level,
                    message,
                    stacktrace,
                }
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        Ok(request)
    }
}

/// Serves the presentation peer
pub struct RelayLink {
    listener: TcpListener,
    sessions: SessionTable,
    file_sender: Arc<dyn FileSender>,
    probe_interval: Duration,
    max_frame_bytes: usize,
}

/// The currently connected peer
struct Peer {
    reader: ChannelReader,
    sender: ChannelSender,
}

impl RelayLink {
    pub fn new(
        listener: TcpListener,
        sessions: SessionTable,
        file_sender: Arc<dyn FileSender>,
        probe_interval: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            listener,
            sessions,
            file_sender,
            probe_interval,
            max_frame_bytes,
        }
    }

    /// Serve peers and forward session events until cancelled
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Relay listening on {}", addr);
        }

        let mut peer: Option<Peer> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) if peer.is_some() => {
                        warn!("Refusing second relay peer {}", addr);
                        drop(socket);
                    }
                    Ok((socket, addr)) => {
                        info!("Relay peer connected from {}", addr);
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!("set_nodelay on relay socket: {}", e);
                        }
                        let channel = FramedChannel::with_max_frame(Box::new(socket), self.max_frame_bytes);
                        let (reader, sender) = channel.into_parts();

                        if self.replay(&sender).await.is_ok() {
                            peer = Some(Peer { reader, sender });
                        } else {
                            warn!("Relay peer {} dropped during replay", addr);
                        }
                    }
                    Err(e) => warn!("Relay accept failed: {}", e),
                },

                Some(event) = events.recv() => {
                    if let Some(p) = &peer {
                        if let Err(e) = forward_event(&p.sender, &event).await {
                            info!("Relay peer gone: {}", e);
                            peer = None;
                        }
                    }
                }

                received = receive_from(&mut peer, self.probe_interval) => match received {
                    Ok(records) if records.is_empty() => {
                        if let Some(p) = &peer {
                            if p.sender.send(keywords::CONNECTION_TEST, None).await.is_err() {
                                info!("Relay peer failed connection test");
                                peer = None;
                            }
                        }
                    }
                    Ok(records) => {
                        for record in &records {
                            self.handle_record(record).await;
                        }
                    }
                    Err(e) => {
                        info!("Relay peer disconnected: {}", e);
                        peer = None;
                    }
                },
            }
        }

        if let Some(p) = peer {
            let _ = p.sender.close().await;
        }
        debug!("Relay stopped");
    }

    /// Send the current device list to a freshly connected peer
    async fn replay(&self, sender: &ChannelSender) -> Result<()> {
        let snapshots: Vec<SessionSnapshot> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionHandle::snapshot)
            .collect();

        for snapshot in &snapshots {
            send_phone_data(sender, &PhoneData::from(snapshot)).await?;
        }
        Ok(())
    }

    async fn handle_record(&self, record: &CommandRecord) {
        if record.keyword != keywords::LOG {
            debug!("Relay peer: {}", record.keyword);
        }

        let request = match RelayRequest::try_from(record) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring relay record '{}': {}", record.keyword, e);
                return;
            }
        };

        if let Err(e) = self.handle_request(request).await {
            warn!("Relay request '{}' failed: {}", record.keyword, e);
        }
    }

    /// Carry out one peer request
    pub async fn handle_request(&self, request: RelayRequest) -> Result<()> {
        match request {
            RelayRequest::DoSync(target) => {
                self.device_sender(&target)
                    .await?
                    .send(keywords::DO_SYNC, None)
                    .await?;
                info!("Requested sync from {}", target.phone_address);
            }
            RelayRequest::SendClipboard { target, text } => {
                self.device_sender(&target)
                    .await?
                    .send(keywords::INCOMING_CLIPBOARD, Some(&text))
                    .await?;
                info!("Sent clipboard to {}", target.phone_address);
            }
            RelayRequest::SendSms { target, sms } => {
                let payload = serde_json::to_string(&sms)?;
                self.device_sender(&target)
                    .await?
                    .send(keywords::SEND_SMS, Some(&payload))
                    .await?;
                info!("Sent SMS request to {}", target.phone_address);
            }
            RelayRequest::SendFile { target, path } => {
                if !self.sessions.read().await.contains_key(&target.phone_address) {
                    return Err(ProtocolError::DeviceNotFound(target.phone_address));
                }

                let file_sender = self.file_sender.clone();
                tokio::spawn(async move {
                    match file_sender.send_file(&target.phone_address, &path).await {
                        Ok(()) => info!(
                            "Sent file {} to {}",
                            path.display(),
                            target.phone_address
                        ),
                        Err(e) => warn!(
                            "Sending {} to {} failed: {}",
                            path.display(),
                            target.phone_address,
                            e
                        ),
                    }
                });
            }
            RelayRequest::Log {
                level,
                message,
                stacktrace,
            } => match level {
                PeerLogLevel::Info => info!(target: "synchrony::gui", "{}", message),
                PeerLogLevel::Debug => debug!(target: "synchrony::gui", "{}", message),
                PeerLogLevel::Error => match stacktrace {
                    Some(trace) => error!(target: "synchrony::gui", "{}\n{}", message, trace),
                    None => error!(target: "synchrony::gui", "{}", message),
                },
            },
        }
        Ok(())
    }

    async fn device_sender(&self, target: &PhoneTarget) -> Result<ChannelSender> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(&target.phone_address)
            .ok_or_else(|| ProtocolError::DeviceNotFound(target.phone_address.clone()))?;

        handle.sender().ok_or_else(|| {
            ProtocolError::InvalidState(format!("{} is not connected", handle.device()))
        })
    }
}

async fn receive_from(peer: &mut Option<Peer>, window: Duration) -> Result<Vec<CommandRecord>> {
    match peer {
        Some(p) => p.reader.receive(window).await,
        None => std::future::pending().await,
    }
}

async fn send_phone_data(sender: &ChannelSender, data: &PhoneData) -> Result<()> {
    let payload = serde_json::to_string(data)?;
    sender
        .send(keywords::INCOMING_PHONE_DATA, Some(&payload))
        .await
}

async fn forward_event(sender: &ChannelSender, event: &SessionEvent) -> Result<()> {
    match event.state {
        SessionState::Stopped => {
            sender
                .send(keywords::REMOVE_PHONE_DATA, Some(&event.device.address))
                .await
        }
        SessionState::Connecting => Ok(()),
        SessionState::Connected | SessionState::Disconnected => {
            send_phone_data(sender, &PhoneData::from(event)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BoxedStream;
    use crate::session::{Session, SessionConfig, SessionServices};
    use crate::sinks::RecordingSink;
    use crate::store::MemoryStore;
    use crate::transport::{Connector, DeviceDescriptor};
    use async_trait::async_trait;

    struct UnreachablePhone;

    #[async_trait]
    impl Connector for UnreachablePhone {
        async fn connect(&self, _device: &DeviceDescriptor) -> Result<BoxedStream> {
            Err(ProtocolError::ConnectionRefused("out of range".into()))
        }
    }

    async fn link_tracking(address: &str, sink: &Arc<RecordingSink>) -> RelayLink {
        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = mpsc::unbounded_channel();
        let handle = Session::spawn(
            DeviceDescriptor::rfcomm("Pixel", address),
            Arc::new(MemoryStore::new()),
            SessionServices {
                connector: Arc::new(UnreachablePhone),
                sinks: sink.sinks(),
            },
            SessionConfig::default(),
            events,
        );
        sessions.write().await.insert(address.to_string(), handle);

        RelayLink::new(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            sessions,
            sink.clone(),
            DEFAULT_PROBE_INTERVAL,
            crate::DEFAULT_MAX_FRAME_BYTES,
        )
    }

    fn target(address: &str) -> PhoneTarget {
        PhoneTarget {
            phone_name: None,
            phone_address: address.into(),
        }
    }

    #[tokio::test]
    async fn test_send_file_goes_to_file_sender() {
        let sink = RecordingSink::new();
        let link = link_tracking("AA", &sink).await;

        link.handle_request(RelayRequest::SendFile {
            target: target("AA"),
            path: PathBuf::from("/tmp/a.txt"),
        })
        .await
        .unwrap();

        // the transfer runs on its own task
        for _ in 0..100 {
            if !sink.sent_files().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            sink.sent_files(),
            vec![("AA".to_string(), "/tmp/a.txt".to_string())]
        );
    }

    #[tokio::test]
    async fn test_requests_for_untracked_device() {
        let sink = RecordingSink::new();
        let link = link_tracking("AA", &sink).await;

        let err = link
            .handle_request(RelayRequest::SendFile {
                target: target("BB"),
                path: PathBuf::from("/tmp/a.txt"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(address) if address == "BB"));
        assert!(sink.sent_files().is_empty());

        let err = link
            .handle_request(RelayRequest::SendClipboard {
                target: target("BB"),
                text: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_clipboard_to_disconnected_device() {
        let sink = RecordingSink::new();
        let link = link_tracking("AA", &sink).await;

        let err = link
            .handle_request(RelayRequest::SendClipboard {
                target: target("AA"),
                text: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    fn request(wire: &str) -> Result<RelayRequest> {
        RelayRequest::try_from(&CommandRecord::parse(wire).unwrap())
    }

    #[test]
    fn test_phone_data_json() {
        let data = PhoneData {
            name: "Pixel".into(),
            address: "AA:BB".into(),
            connected: true,
        };
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"name":"Pixel","address":"AA:BB","btSocketConnected":true}"#
        );
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            request(r#"do_sync: {"phone_name":"Pixel","phone_address":"AA"}"#).unwrap(),
            RelayRequest::DoSync(PhoneTarget {
                phone_name: Some("Pixel".into()),
                phone_address: "AA".into()
            })
        );

        assert!(matches!(
            request(r#"send_clipboard: {"clipboard":"x: y","phone_name":"P","phone_address":"AA"}"#)
                .unwrap(),
            RelayRequest::SendClipboard { text, .. } if text == "x: y"
        ));

        assert!(matches!(
            request(r#"send_file: {"file_name":"/tmp/a.txt","phone_name":"P","phone_address":"AA"}"#)
                .unwrap(),
            RelayRequest::SendFile { path, .. } if path == PathBuf::from("/tmp/a.txt")
        ));

        assert_eq!(
            request(
                r#"send_sms: {"selected_phone":{"phone_name":"P","phone_address":"AA"},"number":"555","message":"hi"}"#
            )
            .unwrap(),
            RelayRequest::SendSms {
                target: PhoneTarget {
                    phone_name: Some("P".into()),
                    phone_address: "AA".into()
                },
                sms: SmsPayload {
                    number: "555".into(),
                    message: "hi".into()
                }
            }
        );
    }

    #[test]
    fn test_parse_log() {
        assert_eq!(
            request(r#"log: ["e", "boom", "trace"]"#).unwrap(),
            RelayRequest::Log {
                level: PeerLogLevel::Error,
                message: "boom".into(),
                stacktrace: Some("trace".into())
            }
        );
        assert!(matches!(
            request(r#"log: ["i", "hello", null]"#).unwrap(),
            RelayRequest::Log { level: PeerLogLevel::Info, stacktrace: None, .. }
        ));
        assert!(request(r#"log: ["x", "?", null]"#).is_err());
    }

    #[test]
    fn test_unknown_request() {
        assert!(matches!(
            request("self_destruct"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(request("do_sync: nope"), Err(ProtocolError::Json(_))));
    }
}
