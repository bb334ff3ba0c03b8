//! Session-oriented neighbor discovery transport
//!
//! Many-to-many sessions with a large MTU: every payload unit carries
//! exactly one encoded packet, so there is no chunking. Endpoints are
//! opaque session handles; the true mesh identity behind an endpoint is
//! only learned from the first packet it delivers, at which point the
//! placeholder identity announced at session-connect time is rewritten.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{codec, MeshPacket};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::TransportResult;
use crate::interface::{EventSink, Transport, TransportEvent, TransportKind};
use crate::link::{LinkDriver, LinkEvent};
use crate::paired_radio::adjacent_identity;

/// Placeholder mesh identity for a session whose owner has not spoken yet.
fn placeholder_identity(endpoint_id: &str) -> String {
    format!("nd-{}", endpoint_id)
}

/// Transport over a session-oriented, connectionless-discovery link.
pub struct NeighborDiscoveryTransport {
    driver: Arc<dyn LinkDriver>,
    active: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
}

impl NeighborDiscoveryTransport {
    pub fn new(driver: Arc<dyn LinkDriver>) -> Self {
        Self {
            driver,
            active: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    async fn run(
        mut link_events: mpsc::Receiver<LinkEvent>,
        events: EventSink,
        shutdown: Arc<Notify>,
    ) {
        // endpoint -> mesh identity we have announced for it
        let mut identities: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = link_events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        LinkEvent::Connected { endpoint_id } => {
                            let placeholder = placeholder_identity(&endpoint_id);
                            identities.insert(endpoint_id.clone(), placeholder.clone());
                            let _ = events
                                .send(TransportEvent::PeerConnected {
                                    endpoint_id,
                                    mesh_id: placeholder.clone(),
                                    display_name: placeholder,
                                    transport: TransportKind::NeighborDiscovery,
                                })
                                .await;
                        }
                        LinkEvent::Disconnected { endpoint_id } => {
                            identities.remove(&endpoint_id);
                            let _ = events
                                .send(TransportEvent::PeerDisconnected {
                                    endpoint_id,
                                    transport: TransportKind::NeighborDiscovery,
                                })
                                .await;
                        }
                        LinkEvent::Data { endpoint_id, bytes } => {
                            let Some(packet) = codec::decode(&bytes) else {
                                debug!("dropping undecodable payload from {}", endpoint_id);
                                continue;
                            };
                            let (mesh_id, display_name) = adjacent_identity(&packet);
                            let known = identities.get(&endpoint_id);
                            if known.map(String::as_str) != Some(mesh_id.as_str()) {
                                // Identity upgrade: rewrite the placeholder
                                // (or stale) identity for this session.
                                identities.insert(endpoint_id.clone(), mesh_id.clone());
                                let _ = events
                                    .send(TransportEvent::PeerConnected {
                                        endpoint_id: endpoint_id.clone(),
                                        mesh_id,
                                        display_name,
                                        transport: TransportKind::NeighborDiscovery,
                                    })
                                    .await;
                            }
                            let _ = events
                                .send(TransportEvent::PacketReceived {
                                    packet,
                                    endpoint_id,
                                    transport: TransportKind::NeighborDiscovery,
                                })
                                .await;
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
        debug!("neighbor discovery receive loop terminated");
    }
}

#[async_trait]
impl Transport for NeighborDiscoveryTransport {
    fn name(&self) -> &str {
        "neighbor-discovery"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::NeighborDiscovery
    }

    async fn is_active(&self) -> bool {
        *self.active.read().await
    }

    async fn start(&self, events: EventSink) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if *active {
            warn!("neighbor discovery already started");
            return Ok(());
        }

        let (link_tx, link_rx) = mpsc::channel(256);
        self.driver.start(link_tx).await?;

        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(Self::run(link_rx, events, shutdown));

        *active = true;
        info!("neighbor discovery transport started");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if !*active {
            return Ok(());
        }
        *active = false;
        self.shutdown.notify_waiters();
        self.driver.stop().await?;
        info!("neighbor discovery transport stopped");
        Ok(())
    }

    async fn send_packet(
        &self,
        packet: &MeshPacket,
        endpoint_id: Option<&str>,
    ) -> TransportResult<()> {
        let bytes = codec::encode(packet)?;
        self.driver.send(endpoint_id, &bytes).await
    }

    async fn send_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()> {
        self.driver.send(endpoint_id, data).await
    }
}
