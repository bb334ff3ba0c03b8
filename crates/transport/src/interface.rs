//! The contract every link technology implements

use async_trait::async_trait;
use protocol::MeshPacket;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportResult;

/// The transport families the dispatcher can drive.
///
/// Ordering is dispatch priority: neighbor discovery first, audio beacons
/// last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    NeighborDiscovery,
    PairedRadio,
    DirectIp,
    AudioBeacon,
}

impl TransportKind {
    /// Lower value wins when ordering transports for startup and fan-out.
    pub fn priority(self) -> u8 {
        match self {
            TransportKind::NeighborDiscovery => 0,
            TransportKind::PairedRadio => 1,
            TransportKind::DirectIp => 2,
            TransportKind::AudioBeacon => 3,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::NeighborDiscovery => write!(f, "neighbor_discovery"),
            TransportKind::PairedRadio => write!(f, "paired_radio"),
            TransportKind::DirectIp => write!(f, "direct_ip"),
            TransportKind::AudioBeacon => write!(f, "audio_beacon"),
        }
    }
}

/// Inbound traffic and link-level lifecycle, reported by every transport
/// through a shared channel.
///
/// Transports never emit `PacketReceived` for bytes that fail to decode.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PacketReceived {
        packet: MeshPacket,
        endpoint_id: String,
        transport: TransportKind,
    },
    PeerConnected {
        endpoint_id: String,
        mesh_id: String,
        display_name: String,
        transport: TransportKind,
    },
    PeerDisconnected {
        endpoint_id: String,
        transport: TransportKind,
    },
}

/// Channel end a transport reports its events into. Injected once before
/// `start()` and never swapped while the transport is active.
pub type EventSink = mpsc::Sender<TransportEvent>;

/// Uniform interface over the heterogeneous link technologies.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    async fn is_active(&self) -> bool;

    /// Begin advertising/discovery/listening. Idempotent.
    async fn start(&self, events: EventSink) -> TransportResult<()>;

    /// Cease all activity and release resources. Idempotent.
    async fn stop(&self) -> TransportResult<()>;

    /// Send an encoded packet. `endpoint_id` of `None` means every
    /// currently connected endpoint on this transport.
    async fn send_packet(
        &self,
        packet: &MeshPacket,
        endpoint_id: Option<&str>,
    ) -> TransportResult<()>;

    /// Raw byte channel for pre-encoded payloads and low-level beacons.
    async fn send_bytes(&self, data: &[u8], endpoint_id: Option<&str>) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TransportKind::NeighborDiscovery.priority() < TransportKind::PairedRadio.priority());
        assert!(TransportKind::PairedRadio.priority() < TransportKind::DirectIp.priority());
        assert!(TransportKind::DirectIp.priority() < TransportKind::AudioBeacon.priority());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TransportKind::NeighborDiscovery).unwrap();
        assert_eq!(json, "\"neighbor_discovery\"");
    }
}
