//! Single send/receive surface over the active transport set
//!
//! The dispatcher owns every registered transport, starts them in priority
//! order, merges their inbound event streams into one handler, publishes
//! aggregate link status, and runs the periodic peer-announcement beacon.
//! One transport's failure never blocks another's traffic.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use protocol::MeshPacket;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::TransportResult;
use crate::interface::{Transport, TransportEvent, TransportKind};

/// Default cadence of the peer-announcement beacon.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Merged inbound event queue depth.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Stored async callback the dispatcher feeds inbound events into.
pub type EventHandler =
    Arc<dyn Fn(TransportEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Stored async callback invoked on every announcement tick.
pub type Announcer = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Activity flag for one registered transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub kind: TransportKind,
    pub active: bool,
}

/// Aggregate link status across the whole transport set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub is_active: bool,
    pub active_transports: Vec<TransportKind>,
    pub transport_states: Vec<TransportState>,
    pub connected_peer_count: usize,
}

/// Owns the transport set and routes outbound packets to it.
pub struct TransportDispatcher {
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    handler: RwLock<Option<EventHandler>>,
    announcer: RwLock<Option<Announcer>>,
    status_tx: watch::Sender<LinkStatus>,
    connected: Arc<RwLock<HashMap<TransportKind, HashSet<String>>>>,
    shutdown: Arc<Notify>,
    running: RwLock<bool>,
    announce_interval: Duration,
}

impl TransportDispatcher {
    pub fn new() -> Self {
        Self::with_announce_interval(ANNOUNCE_INTERVAL)
    }

    pub fn with_announce_interval(announce_interval: Duration) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            transports: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            announcer: RwLock::new(None),
            status_tx,
            connected: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
            running: RwLock::new(false),
            announce_interval,
        }
    }

    /// Add a transport. The set is kept in priority order; registration is
    /// only valid before `start_all`.
    pub async fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.write().await;
        transports.push(transport);
        transports.sort_by_key(|t| t.kind().priority());
    }

    /// Install the inbound event target. Set once, before `start_all`.
    pub async fn set_handler(&self, handler: EventHandler) {
        *self.handler.write().await = Some(handler);
    }

    /// Install the announcement-beacon callback. Set once, before
    /// `start_all`.
    pub async fn set_announcer(&self, announcer: Announcer) {
        *self.announcer.write().await = Some(announcer);
    }

    /// Latest aggregate status.
    pub fn status(&self) -> LinkStatus {
        self.status_tx.borrow().clone()
    }

    /// Latest-value stream of aggregate status.
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    async fn publish_status(&self) {
        let transports = self.transports.read().await;
        let mut states = Vec::with_capacity(transports.len());
        let mut active_kinds = Vec::new();
        for transport in transports.iter() {
            let active = transport.is_active().await;
            if active {
                active_kinds.push(transport.kind());
            }
            states.push(TransportState {
                kind: transport.kind(),
                active,
            });
        }
        let connected_peer_count = self
            .connected
            .read()
            .await
            .values()
            .map(HashSet::len)
            .sum();
        let status = LinkStatus {
            is_active: !active_kinds.is_empty(),
            active_transports: active_kinds,
            transport_states: states,
            connected_peer_count,
        };
        let _ = self.status_tx.send(status);
    }

    /// Start every registered transport in priority order, tolerating
    /// individual failures, then spawn the inbound pump and the
    /// announcement ticker.
    pub async fn start_all(self: &Arc<Self>) -> TransportResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("dispatcher already running");
                return Ok(());
            }
            *running = true;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let transports = self.transports.read().await.clone();
        for transport in &transports {
            match transport.start(event_tx.clone()).await {
                Ok(()) => info!("started transport {}", transport.name()),
                Err(e) => warn!("transport {} failed to start: {}", transport.name(), e),
            }
            self.publish_status().await;
        }
        drop(event_tx);

        let pump_self = Arc::clone(self);
        tokio::spawn(async move { pump_self.pump(event_rx).await });

        let announce_self = Arc::clone(self);
        tokio::spawn(async move { announce_self.announce_loop().await });

        Ok(())
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match &event {
                        TransportEvent::PeerConnected {
                            endpoint_id,
                            transport,
                            ..
                        } => {
                            self.connected
                                .write()
                                .await
                                .entry(*transport)
                                .or_default()
                                .insert(endpoint_id.clone());
                            self.publish_status().await;
                        }
                        TransportEvent::PeerDisconnected {
                            endpoint_id,
                            transport,
                        } => {
                            if let Some(set) = self.connected.write().await.get_mut(transport) {
                                set.remove(endpoint_id);
                            }
                            self.publish_status().await;
                        }
                        TransportEvent::PacketReceived { .. } => {}
                    }
                    let handler = self.handler.read().await.clone();
                    if let Some(handler) = handler {
                        handler(event).await;
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!("dispatcher pump terminated");
    }

    async fn announce_loop(self: Arc<Self>) {
        let mut ticker = interval(self.announce_interval);
        // The first tick fires immediately; skip it so the initial
        // announcement happens after transports have settled.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let announcer = self.announcer.read().await.clone();
                    if let Some(announcer) = announcer {
                        announcer().await;
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!("announcement ticker terminated");
    }

    /// Stop every started transport, regardless of individual errors, and
    /// clear the active set.
    pub async fn stop_all(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown.notify_waiters();

        let transports = self.transports.read().await.clone();
        for transport in &transports {
            if let Err(e) = transport.stop().await {
                warn!("transport {} failed to stop: {}", transport.name(), e);
            }
        }
        self.connected.write().await.clear();
        self.publish_status().await;
        info!("all transports stopped");
    }

    /// Route one packet outbound. A concrete `transport_kind` targets that
    /// transport alone (skipped when inactive); `None` fans out to every
    /// active transport. Send errors are logged and swallowed so one
    /// transport never blocks another.
    pub async fn send(
        &self,
        packet: &MeshPacket,
        endpoint_id: Option<&str>,
        transport_kind: Option<TransportKind>,
    ) {
        let transports = self.transports.read().await.clone();
        match transport_kind {
            Some(kind) => {
                let Some(transport) = transports.iter().find(|t| t.kind() == kind) else {
                    warn!("no transport registered for {}", kind);
                    return;
                };
                if !transport.is_active().await {
                    debug!("transport {} inactive, dropping targeted send", kind);
                    return;
                }
                if let Err(e) = transport.send_packet(packet, endpoint_id).await {
                    warn!(
                        "targeted send of {} via {} failed: {}",
                        packet.packet_id, kind, e
                    );
                }
            }
            None => {
                for transport in &transports {
                    if !transport.is_active().await {
                        continue;
                    }
                    if let Err(e) = transport.send_packet(packet, endpoint_id).await {
                        warn!(
                            "fan-out send of {} via {} failed: {}",
                            packet.packet_id,
                            transport.kind(),
                            e
                        );
                    }
                }
            }
        }
    }
}

impl Default for TransportDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
