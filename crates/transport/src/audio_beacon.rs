//! Audio-band beacon transport
//!
//! The audio channel is lossy and tiny, so it never carries full packets.
//! It transmits fixed `HELLO:<short_id>` presence beacons (at most 255
//! bytes) and reports detected beacons as synthetic peers, giving the mesh
//! a heads-up that somebody is in acoustic range.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use protocol::MeshPacket;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::interface::{EventSink, Transport, TransportEvent, TransportKind};
use crate::link::{LinkDriver, LinkEvent};

/// Beacons never exceed this size.
pub const MAX_BEACON_BYTES: usize = 255;

const BEACON_PREFIX: &str = "HELLO:";

/// How often the presence beacon is re-transmitted.
const BEACON_INTERVAL: Duration = Duration::from_secs(15);

/// A detected peer is re-announced at most this often.
const REDETECT_INTERVAL: Duration = Duration::from_secs(60);

/// Build the presence beacon for a mesh identity.
pub fn hello_beacon(local_mesh_id: &str) -> Vec<u8> {
    let short: String = local_mesh_id.chars().take(4).collect();
    format!("{}{}", BEACON_PREFIX, short).into_bytes()
}

/// Parse a detected beacon; returns the advertised short id.
pub fn parse_beacon(bytes: &[u8]) -> Option<String> {
    if bytes.len() > MAX_BEACON_BYTES {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let short = text.strip_prefix(BEACON_PREFIX)?.trim();
    if short.is_empty() {
        return None;
    }
    Some(short.to_string())
}

/// Presence-only transport over audio-band beacons.
pub struct AudioBeaconTransport {
    driver: Arc<dyn LinkDriver>,
    local_mesh_id: String,
    active: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
}

impl AudioBeaconTransport {
    pub fn new(driver: Arc<dyn LinkDriver>, local_mesh_id: impl Into<String>) -> Self {
        Self {
            driver,
            local_mesh_id: local_mesh_id.into(),
            active: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    async fn run(
        driver: Arc<dyn LinkDriver>,
        local_mesh_id: String,
        mut link_events: mpsc::Receiver<LinkEvent>,
        events: EventSink,
        shutdown: Arc<Notify>,
    ) {
        let beacon = hello_beacon(&local_mesh_id);
        let mut beacon_timer = interval(BEACON_INTERVAL);
        let mut last_detected: HashMap<String, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = beacon_timer.tick() => {
                    if let Err(e) = driver.send(None, &beacon).await {
                        debug!("beacon transmit failed: {}", e);
                    }
                }
                event = link_events.recv() => {
                    let Some(event) = event else { break };
                    if let LinkEvent::Data { bytes, .. } = event {
                        let Some(short_id) = parse_beacon(&bytes) else {
                            continue;
                        };
                        let synthetic = format!("audio-{}", short_id);
                        let recent = last_detected
                            .get(&synthetic)
                            .is_some_and(|at| at.elapsed() < REDETECT_INTERVAL);
                        last_detected.insert(synthetic.clone(), Instant::now());
                        if recent {
                            continue;
                        }
                        debug!("audio beacon detected: {}", synthetic);
                        let _ = events
                            .send(TransportEvent::PeerConnected {
                                endpoint_id: synthetic.clone(),
                                mesh_id: synthetic.clone(),
                                display_name: synthetic,
                                transport: TransportKind::AudioBeacon,
                            })
                            .await;
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
        debug!("audio beacon loop terminated");
    }
}

#[async_trait]
impl Transport for AudioBeaconTransport {
    fn name(&self) -> &str {
        "audio-beacon"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::AudioBeacon
    }

    async fn is_active(&self) -> bool {
        *self.active.read().await
    }

    async fn start(&self, events: EventSink) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if *active {
            warn!("audio beacon already started");
            return Ok(());
        }

        let (link_tx, link_rx) = mpsc::channel(64);
        self.driver.start(link_tx).await?;

        tokio::spawn(Self::run(
            Arc::clone(&self.driver),
            self.local_mesh_id.clone(),
            link_rx,
            events,
            Arc::clone(&self.shutdown),
        ));

        *active = true;
        info!("audio beacon transport started");
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
        info!("audio beacon transport stopped");
        Ok(())
    }

    /// Full packets never ride the audio band; fan-out sends land here and
    /// are skipped.
    async fn send_packet(
        &self,
        packet: &MeshPacket,
        _endpoint_id: Option<&str>,
    ) -> TransportResult<()> {
        debug!(
            "audio beacon carries presence only, skipping packet {}",
            packet.packet_id
        );
        Ok(())
    }

    async fn send_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()> {
        if data.len() > MAX_BEACON_BYTES {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                limit: MAX_BEACON_BYTES,
            });
        }
        self.driver.send(endpoint_id, data).await
    }
}
