//! Device Session
//!
//! One [`Session`] per tracked device, each running on its own tokio task so
//! a stalled phone never holds up the others.
//!
//! ## Lifecycle
//!
//! ```text
//!              connect ok
//! Disconnected ──────────► Connecting ──────► Connected
//!      ▲   ▲                    │                 │
//!      │   └──── connect fails ─┘                 │
//!      │         (wait backoff)                   │
//!      └──── channel error / no activity ─────────┘
//!
//! stop() from any state ──► Stopped
//! ```
//!
//! The first connect attempt is immediate; every later attempt waits the
//! fixed reconnect backoff first. A connection is considered starved when
//! nothing has arrived for longer than the activity timeout, measured from
//! the last record or, if none arrived yet, from the moment of connecting.
//!
//! The worker is the only writer of its [`SessionStatus`]; everyone else
//! observes it through the [`SessionHandle`]. Every state change is
//! published there, but a [`SessionEvent`] is raised only when a connection
//! is established, when an established connection ends, and on stop, so
//! failed connect attempts stay quiet.

use crate::channel::{ChannelSender, FramedChannel, DEFAULT_MAX_FRAME_BYTES};
use crate::command::CommandRecord;
use crate::dispatcher::{dispatch, SessionContext};
use crate::sinks::Sinks;
use crate::store::RecordStore;
use crate::transport::{Connector, DeviceDescriptor};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default read poll window
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default starvation window
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay between connect attempts
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default bound on a single connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of an idle photo transfer
pub const DEFAULT_CHUNK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long one channel read may block
    pub poll_timeout: Duration,
    /// Silence longer than this drops the connection
    pub activity_timeout: Duration,
    /// Wait between connect attempts
    pub reconnect_backoff: Duration,
    /// Bound on one connect attempt and on each write to the device
    pub connect_timeout: Duration,
    /// Bytes buffered without a delimiter before discarding
    pub max_frame_bytes: usize,
    /// Idle photo transfers older than this are dropped; zero keeps them
    pub chunk_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            chunk_ttl: DEFAULT_CHUNK_TTL,
        }
    }
}

/// Live view of a session, published by its worker
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    sender: Option<ChannelSender>,
}

impl SessionStatus {
    fn disconnected() -> Self {
        Self {
            state: SessionState::Disconnected,
            connected_at: None,
            last_activity_at: None,
            sender: None,
        }
    }
}

/// Point-in-time copy of a session for relay replay and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub name: String,
    pub address: String,
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Raised when a device is announced, connects, loses its connection or stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub device: DeviceDescriptor,
    pub state: SessionState,
}

/// Collaborators shared by all sessions
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<dyn Connector>,
    pub sinks: Sinks,
}

/// Why a connection ended
enum Disconnect {
    Stopped,
    Failed(ProtocolError),
}

pub struct Session {
    device: DeviceDescriptor,
    store: Arc<dyn RecordStore>,
    services: SessionServices,
    config: SessionConfig,
    status: watch::Sender<SessionStatus>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl Session {
    /// Start a worker for `device` and return its handle
    pub fn spawn(
        device: DeviceDescriptor,
        store: Arc<dyn RecordStore>,
        services: SessionServices,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus::disconnected());
        let cancel = CancellationToken::new();

        let session = Session {
            device: device.clone(),
            store,
            services,
            config,
            status: status_tx,
            events,
            cancel: cancel.clone(),
        };

        info!("Starting session for {}", device);
        let task = tokio::spawn(session.run());

        SessionHandle {
            device,
            status: status_rx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(self) {
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(self.config.reconnect_backoff) => {}
                }
            }
            first_attempt = false;

            self.set_state(SessionState::Connecting);

            let connect = timeout(
                self.config.connect_timeout,
                self.services.connector.connect(&self.device),
            );
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect => result,
            };

            let stream = match stream {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(device = %self.device.address, "Connect failed: {}", e);
                    self.set_state(SessionState::Disconnected);
                    continue;
                }
                Err(_) => {
                    debug!(
                        device = %self.device.address,
                        "Connect timed out after {:?}",
                        self.config.connect_timeout
                    );
                    self.set_state(SessionState::Disconnected);
                    continue;
                }
            };

            match self.serve(stream).await {
                Disconnect::Stopped => break,
                Disconnect::Failed(e) => {
                    warn!("Lost connection to {}: {}", self.device, e);
                }
            }
        }

        self.set_state(SessionState::Stopped);
        self.emit(SessionState::Stopped);
        info!("Session for {} stopped", self.device);
    }

    /// Serve one connection until it fails or the session is stopped
    async fn serve(&self, stream: crate::channel::BoxedStream) -> Disconnect {
        let channel = FramedChannel::with_max_frame(stream, self.config.max_frame_bytes)
            .with_write_timeout(self.config.connect_timeout);
        let (mut reader, sender) = channel.into_parts();

        let connected_at = Instant::now();
        let mut ctx = SessionContext::new(
            self.device.clone(),
            sender.clone(),
            self.store.clone(),
            self.services.sinks.clone(),
            self.config.chunk_ttl,
        );

        self.status.send_modify(|status| {
            status.state = SessionState::Connected;
            status.connected_at = Some(Utc::now());
            status.last_activity_at = None;
            status.sender = Some(sender.clone());
        });
        self.emit(SessionState::Connected);
        info!("Connected to {}", self.device);

        let reason = loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break Disconnect::Stopped,
                received = reader.receive(self.config.poll_timeout) => received,
            };

            let records = match received {
                Ok(records) => records,
                Err(e) => break Disconnect::Failed(e),
            };

            let active_before = ctx.last_activity_at();
            let dispatched = tokio::select! {
                _ = self.cancel.cancelled() => break Disconnect::Stopped,
                dispatched = self.dispatch_all(&records, &mut ctx) => dispatched,
            };
            if let Err(e) = dispatched {
                break Disconnect::Failed(e);
            }

            if ctx.last_activity_at() != active_before {
                self.status.send_modify(|status| status.last_activity_at = Some(Utc::now()));
            }

            ctx.reassembler_mut().evict_stale();
            ctx.reap_photo_writes();

            let idle_since = ctx.last_activity_at().unwrap_or(connected_at);
            if idle_since.elapsed() > self.config.activity_timeout {
                break Disconnect::Failed(ProtocolError::Starvation(
                    self.config.activity_timeout,
                ));
            }
        };

        if let Err(e) = sender.close().await {
            debug!(device = %self.device.address, "Closing channel: {}", e);
        }
        ctx.flush_photo_writes().await;

        self.status.send_modify(|status| {
            *status = SessionStatus::disconnected();
        });
        self.emit(SessionState::Disconnected);

        reason
    }

    /// Dispatch a batch; only a connection-fatal error stops it
    async fn dispatch_all(&self, records: &[CommandRecord], ctx: &mut SessionContext) -> Result<()> {
        for record in records {
            debug!(device = %self.device.address, "Received {}", record.keyword);

            if let Err(e) = dispatch(record, ctx).await {
                if e.is_connection_fatal() {
                    return Err(e);
                }
                warn!(
                    device = %self.device.address,
                    "Skipping '{}': {}",
                    record.keyword, e
                );
            }
        }
        Ok(())
    }

    /// Publish `state` to observers without raising an event
    fn set_state(&self, state: SessionState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    fn emit(&self, state: SessionState) {
        // nobody listening is fine
        let _ = self.events.send(SessionEvent {
            device: self.device.clone(),
            state,
        });
    }
}

/// Owner's handle to a running session
///
/// Dropping the handle cancels the worker without waiting for it.
pub struct SessionHandle {
    device: DeviceDescriptor,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status.borrow();
        SessionSnapshot {
            name: self.device.name.clone(),
            address: self.device.address.clone(),
            state: status.state,
            connected_at: status.connected_at,
            last_activity_at: status.last_activity_at,
        }
    }

    /// Sender of the live channel, if connected
    pub fn sender(&self) -> Option<ChannelSender> {
        self.status.borrow().sender.clone()
    }

    /// Send a record to the device over the live channel
    pub async fn send(&self, keyword: &str, payload: Option<&str>) -> Result<()> {
        match self.sender() {
            Some(sender) => sender.send(keyword, payload).await,
            None => Err(ProtocolError::InvalidState(format!(
                "{} is not connected",
                self.device
            ))),
        }
    }

    /// Cancel the worker and wait until it has closed its channel
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task for {} failed: {}", self.device, e);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}
