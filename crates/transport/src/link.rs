//! Link driver seam beneath the radio-backed transports
//!
//! Radio-specific driver code (advertising intervals, channel negotiation,
//! OS permission flows) lives outside this crate. A driver only has to
//! surface link-level connects, disconnects, and raw data frames, and
//! accept outbound frames for one endpoint or all of them.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportResult;

/// Raw link-level happenings a driver reports.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected { endpoint_id: String },
    Disconnected { endpoint_id: String },
    Data { endpoint_id: String, bytes: Vec<u8> },
}

/// Platform-agnostic seam for a single link technology's driver.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Bring the link up and report events into `events`. Idempotent.
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> TransportResult<()>;

    /// Tear the link down. Idempotent.
    async fn stop(&self) -> TransportResult<()>;

    /// Write one frame. `endpoint_id` of `None` targets every connected
    /// endpoint.
    async fn send(&self, endpoint_id: Option<&str>, bytes: &[u8]) -> TransportResult<()>;

    /// Endpoints with a live link right now.
    async fn connected_endpoints(&self) -> Vec<String>;
}
