//! IP-over-P2P transport
//!
//! TCP-framed: every packet travels as a 4-byte little-endian length
//! prefix followed by the encoded payload, capped at 10 MiB. One task per
//! connection; outbound connects time out after 10 seconds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::{codec, MeshPacket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::interface::{EventSink, Transport, TransportEvent, TransportKind};
use crate::paired_radio::adjacent_identity;

/// Hard cap on a single framed payload.
pub const MAX_FRAME_BYTES: usize = 10_000_000;

/// Outbound TCP connect budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection outbound queue depth.
const WRITE_QUEUE_DEPTH: usize = 64;

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    if reader.read_exact(&mut len_bytes).await.is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds cap", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Transport over direct TCP links between P2P-connected devices.
pub struct DirectIpTransport {
    listen_addr: String,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    active: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
    writers: Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
    events: Arc<RwLock<Option<EventSink>>>,
}

impl DirectIpTransport {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            local_addr: Arc::new(RwLock::new(None)),
            active: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
            writers: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(None)),
        }
    }

    /// Address the listener actually bound, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Register a live stream: one writer queue plus a reader task that
    /// decodes frames and reports them upstream.
    async fn adopt_stream(
        stream: TcpStream,
        endpoint_id: String,
        events: EventSink,
        writers: Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
        shutdown: Arc<Notify>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        writers.write().await.insert(endpoint_id.clone(), write_tx);

        // Writer task: drain the queue onto the socket.
        let writer_endpoint = endpoint_id.clone();
        tokio::spawn(async move {
            while let Some(payload) = write_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &payload).await {
                    debug!("write to {} failed: {}", writer_endpoint, e);
                    break;
                }
            }
        });

        // Reader task: frames in, packets up.
        tokio::spawn(async move {
            let mut announced = false;
            loop {
                tokio::select! {
                    frame = read_frame(&mut read_half) => {
                        match frame {
                            Ok(Some(payload)) => {
                                let Some(packet) = codec::decode(&payload) else {
                                    debug!("dropping undecodable frame from {}", endpoint_id);
                                    continue;
                                };
                                if !announced {
                                    announced = true;
                                    let (mesh_id, display_name) = adjacent_identity(&packet);
                                    let _ = events
                                        .send(TransportEvent::PeerConnected {
                                            endpoint_id: endpoint_id.clone(),
                                            mesh_id,
                                            display_name,
                                            transport: TransportKind::DirectIp,
                                        })
                                        .await;
                                }
                                let _ = events
                                    .send(TransportEvent::PacketReceived {
                                        packet,
                                        endpoint_id: endpoint_id.clone(),
                                        transport: TransportKind::DirectIp,
                                    })
                                    .await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!("read from {} failed: {}", endpoint_id, e);
                                break;
                            }
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
            writers.write().await.remove(&endpoint_id);
            let _ = events
                .send(TransportEvent::PeerDisconnected {
                    endpoint_id: endpoint_id.clone(),
                    transport: TransportKind::DirectIp,
                })
                .await;
            debug!("connection to {} closed", endpoint_id);
        });
    }

    async fn connect(&self, endpoint_id: &str) -> TransportResult<mpsc::Sender<Vec<u8>>> {
        let events = self
            .events
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotActive)?;

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint_id))
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))??;

        info!("connected to {}", endpoint_id);
        Self::adopt_stream(
            stream,
            endpoint_id.to_string(),
            events,
            Arc::clone(&self.writers),
            Arc::clone(&self.shutdown),
        )
        .await;

        self.writers
            .read()
            .await
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| TransportError::EndpointNotFound(endpoint_id.to_string()))
    }

    async fn dispatch_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        match endpoint_id {
            Some(endpoint) => {
                let existing = self.writers.read().await.get(endpoint).cloned();
                let writer = match existing {
                    Some(writer) => writer,
                    None => self.connect(endpoint).await?,
                };
                writer
                    .send(data.to_vec())
                    .await
                    .map_err(|_| TransportError::SendFailed(endpoint.to_string()))
            }
            None => {
                let writers: Vec<(String, mpsc::Sender<Vec<u8>>)> = self
                    .writers
                    .read()
                    .await
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (endpoint, writer) in writers {
                    if writer.send(data.to_vec()).await.is_err() {
                        warn!("send to {} failed, connection gone", endpoint);
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for DirectIpTransport {
    fn name(&self) -> &str {
        "direct-ip"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::DirectIp
    }

    async fn is_active(&self) -> bool {
        *self.active.read().await
    }

    async fn start(&self, events: EventSink) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if *active {
            warn!("direct ip already started");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| TransportError::StartFailed(format!("bind {}: {}", self.listen_addr, e)))?;
        let bound = listener.local_addr()?;
        *self.local_addr.write().await = Some(bound);
        *self.events.write().await = Some(events.clone());

        let writers = Arc::clone(&self.writers);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                Self::adopt_stream(
                                    stream,
                                    peer_addr.to_string(),
                                    events.clone(),
                                    Arc::clone(&writers),
                                    Arc::clone(&shutdown),
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!("accept failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
            debug!("direct ip accept loop terminated");
        });

        *active = true;
        info!("direct ip transport listening on {}", bound);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let mut active = self.active.write().await;
        if !*active {
            return Ok(());
        }
        *active = false;
        self.shutdown.notify_waiters();
        self.writers.write().await.clear();
        *self.events.write().await = None;
        *self.local_addr.write().await = None;
        info!("direct ip transport stopped");
        Ok(())
    }

    async fn send_packet(
        &self,
        packet: &MeshPacket,
        endpoint_id: Option<&str>,
    ) -> TransportResult<()> {
        let bytes = codec::encode(packet)?;
        self.dispatch_bytes(&bytes, endpoint_id).await
    }

    async fn send_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()> {
        self.dispatch_bytes(data, endpoint_id).await
    }
}
