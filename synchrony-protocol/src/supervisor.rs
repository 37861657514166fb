//! Session Supervisor
//!
//! Polls discovery on a fixed interval and keeps exactly one [`Session`] per
//! reachable compatible device. The supervisor's poll task is the only writer
//! of the session table; the relay link reads it to route peer requests.

use crate::discovery::{DeviceDiscovery, DiscoveredDevice};
use crate::relay::{RelayLink, SessionTable, DEFAULT_PROBE_INTERVAL};
use crate::session::{
    Session, SessionConfig, SessionEvent, SessionHandle, SessionServices, SessionState,
};
use crate::store::StoreFactory;
use crate::transport::DEFAULT_RFCOMM_CHANNEL;
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default discovery poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    /// Channel used for devices discovery reports without an endpoint
    pub rfcomm_channel: u8,
    /// Relay peer is probed after this much silence
    pub probe_interval: Duration,
    pub session: SessionConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            rfcomm_channel: DEFAULT_RFCOMM_CHANNEL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            session: SessionConfig::default(),
        }
    }
}

pub struct Supervisor {
    discovery: Arc<dyn DeviceDiscovery>,
    stores: Arc<dyn StoreFactory>,
    services: SessionServices,
    config: SupervisorConfig,
    sessions: SessionTable,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Supervisor {
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        stores: Arc<dyn StoreFactory>,
        services: SessionServices,
        config: SupervisorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            discovery,
            stores,
            services,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    /// Take the stream of session events, if nobody has yet
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Reconcile the session table with one discovery result
    pub async fn poll_once(&self) -> Result<()> {
        let present: HashMap<String, DiscoveredDevice> = self
            .discovery
            .discover()
            .await?
            .into_iter()
            .filter(DiscoveredDevice::is_compatible)
            .map(|device| (device.address.clone(), device))
            .collect();

        let gone: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            let addresses: Vec<String> = sessions
                .keys()
                .filter(|address| !present.contains_key(*address))
                .cloned()
                .collect();
            addresses
                .iter()
                .filter_map(|address| sessions.remove(address))
                .collect()
        };

        for handle in gone {
            info!("{} is no longer reachable", handle.device());
            handle.stop().await;
        }

        for (address, device) in present {
            if self.sessions.read().await.contains_key(&address) {
                continue;
            }

            let descriptor = device.descriptor(self.config.rfcomm_channel);
            let store = match self.stores.open(&descriptor) {
                Ok(store) => store,
                Err(e) => {
                    warn!("Cannot open record store for {}: {}", descriptor, e);
                    continue;
                }
            };

            info!("Tracking {}", descriptor);
            // announce before the worker can report a connection
            let _ = self.events_tx.send(SessionEvent {
                device: descriptor.clone(),
                state: SessionState::Disconnected,
            });

            let handle = Session::spawn(
                descriptor,
                store,
                self.services.clone(),
                self.config.session.clone(),
                self.events_tx.clone(),
            );
            self.sessions.write().await.insert(address, handle);
        }

        Ok(())
    }

    /// Stop and forget every session
    pub async fn stop_all(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            handle.stop().await;
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Device discovery failed: {}", e);
                    }
                }
            }
        }

        self.stop_all().await;
        debug!("Supervisor stopped");
    }

    /// Start polling, and serving a relay peer on `relay` if given
    pub fn spawn(mut self, relay: Option<TcpListener>) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let sessions = self.sessions.clone();

        let relay_addr = relay
            .as_ref()
            .and_then(|listener| listener.local_addr().ok());

        let relay_task = match (relay, self.events_rx.take()) {
            (Some(listener), Some(events)) => {
                let link = RelayLink::new(
                    listener,
                    sessions.clone(),
                    self.services.sinks.file_sender.clone(),
                    self.config.probe_interval,
                    self.config.session.max_frame_bytes,
                );
                Some(tokio::spawn(link.run(events, cancel.clone())))
            }
            _ => None,
        };

        let poll_task = tokio::spawn(self.run(cancel.clone()));

        SupervisorHandle {
            cancel,
            sessions,
            relay_addr,
            poll_task,
            relay_task,
        }
    }
}

/// Handle to a running supervisor
pub struct SupervisorHandle {
    cancel: CancellationToken,
    sessions: SessionTable,
    relay_addr: Option<SocketAddr>,
    poll_task: JoinHandle<()>,
    relay_task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    /// Address the relay is listening on
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_addr
    }

    /// Stop polling, stop every session, then stop the relay
    pub async fn shutdown(self) {
        self.cancel.cancel();

        if let Err(e) = self.poll_task.await {
            warn!("Supervisor task failed: {}", e);
        }
        if let Some(relay) = self.relay_task {
            if let Err(e) = relay.await {
                warn!("Relay task failed: {}", e);
            }
        }
        info!("Supervisor shut down");
    }
}
