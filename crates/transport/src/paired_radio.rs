//! Pairwise short-range radio transport
//!
//! The underlying radio has a small MTU, so outbound payloads are split
//! into 500-byte chunks written sequentially. Inbound chunks accumulate in
//! a per-endpoint buffer until the concatenation decodes as a packet; a
//! buffer that sees no traffic for 30 seconds is discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use protocol::{codec, MeshPacket};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::TransportResult;
use crate::interface::{EventSink, Transport, TransportEvent, TransportKind};
use crate::link::{LinkDriver, LinkEvent};

/// Radio write size; outbound payloads are split at this boundary.
pub const RADIO_CHUNK_BYTES: usize = 500;

/// A reassembly buffer idle for this long is discarded.
const REASSEMBLY_EXPIRY: Duration = Duration::from_secs(30);

/// How often idle reassembly buffers are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct ReassemblyBuffer {
    data: Vec<u8>,
    last_frame: Instant,
}

/// Transport over a pairwise short-range radio link.
pub struct PairedRadioTransport {
    driver: Arc<dyn LinkDriver>,
    active: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
}

impl PairedRadioTransport {
    pub fn new(driver: Arc<dyn LinkDriver>) -> Self {
        Self {
            driver,
            active: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Split an encoded payload at the radio write size.
    fn chunks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
        data.chunks(RADIO_CHUNK_BYTES)
    }

    async fn write_chunked(&self, endpoint_id: Option<&str>, data: &[u8]) -> TransportResult<()> {
        for chunk in Self::chunks(data) {
            self.driver.send(endpoint_id, chunk).await?;
        }
        Ok(())
    }

    async fn run(
        mut link_events: mpsc::Receiver<LinkEvent>,
        events: EventSink,
        shutdown: Arc<Notify>,
    ) {
        let mut buffers: HashMap<String, ReassemblyBuffer> = HashMap::new();
        let mut announced: HashSet<String> = HashSet::new();
        let mut sweep = interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                event = link_events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        LinkEvent::Connected { endpoint_id } => {
                            debug!("paired radio link up: {}", endpoint_id);
                        }
                        LinkEvent::Disconnected { endpoint_id } => {
                            buffers.remove(&endpoint_id);
                            if announced.remove(&endpoint_id) {
                                let _ = events
                                    .send(TransportEvent::PeerDisconnected {
                                        endpoint_id,
                                        transport: TransportKind::PairedRadio,
                                    })
                                    .await;
                            }
                        }
                        LinkEvent::Data { endpoint_id, bytes } => {
                            let buffer = buffers
                                .entry(endpoint_id.clone())
                                .or_insert_with(|| ReassemblyBuffer {
                                    data: Vec::new(),
                                    last_frame: Instant::now(),
                                });
                            if buffer.last_frame.elapsed() > REASSEMBLY_EXPIRY {
                                debug!(
                                    "discarding stale reassembly buffer for {} ({} bytes)",
                                    endpoint_id,
                                    buffer.data.len()
                                );
                                buffer.data.clear();
                            }
                            buffer.data.extend_from_slice(&bytes);
                            buffer.last_frame = Instant::now();

                            if let Some(packet) = codec::decode(&buffer.data) {
                                buffers.remove(&endpoint_id);
                                if announced.insert(endpoint_id.clone()) {
                                    let (mesh_id, display_name) = adjacent_identity(&packet);
                                    let _ = events
                                        .send(TransportEvent::PeerConnected {
                                            endpoint_id: endpoint_id.clone(),
                                            mesh_id,
                                            display_name,
                                            transport: TransportKind::PairedRadio,
                                        })
                                        .await;
                                }
                                let _ = events
                                    .send(TransportEvent::PacketReceived {
                                        packet,
                                        endpoint_id,
                                        transport: TransportKind::PairedRadio,
                                    })
                                    .await;
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    buffers.retain(|endpoint_id, buffer| {
                        let keep = buffer.last_frame.elapsed() <= REASSEMBLY_EXPIRY;
                        if !keep {
                            debug!(
                                "expiring reassembly buffer for {} ({} bytes)",
                                endpoint_id,
                                buffer.data.len()
                            );
                        }
                        keep
                    });
                }
                _ = shutdown.notified() => break,
            }
        }
        debug!("paired radio receive loop terminated");
    }
}

/// Identity of the node on the far end of a link, derived from a packet it
/// handed us: the last forwarder when there is one, otherwise the origin.
pub(crate) fn adjacent_identity(packet: &MeshPacket) -> (String, String) {
    if packet.previous_hop.is_empty() {
        (packet.sender_id.clone(), packet.sender_name.clone())
    } else {
        let short: String = packet.previous_hop.chars().take(8).collect();
        (packet.previous_hop.clone(), short)
    }
}

#[async_trait]
impl Transport for PairedRadioTransport {
    fn name(&self) -> &str {
        "paired-radio"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PairedRadio
    }

    async fn is_active(&self) -> bool {
        *self.active.read().await
    }

    async fn start(&self, events: EventSink) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if *active {
            warn!("paired radio already started");
            return Ok(());
        }

        let (link_tx, link_rx) = mpsc::channel(256);
        self.driver.start(link_tx).await?;

        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(Self::run(link_rx, events, shutdown));

        *active = true;
        info!("paired radio transport started");
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
        info!("paired radio transport stopped");
        Ok(())
    }

    async fn send_packet(
        &self,
        packet: &MeshPacket,
        endpoint_id: Option<&str>,
    ) -> TransportResult<()> {
        let bytes = codec::encode(packet)?;
        self.write_chunked(endpoint_id, &bytes).await
    }

    async fn send_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()> {
        self.write_chunked(endpoint_id, data).await
    }
}
