//! Store-and-forward: replaying held messages to peers that come back
//!
//! Undelivered outbound messages live in the message store, not in a
//! separate queue, so a replay survives restarts. When a destination
//! becomes reachable the router asks for its pending batch and re-emits
//! each message with its original packet id, keeping downstream
//! deduplication intact.

use std::sync::Arc;

use chrono::{Duration, Utc};
use protocol::{ContentKind, MeshPacket, PacketKind, PROTOCOL_VERSION};
use storage::{ConnectionState, MeshMessage, MessageStore, PeerStore};
use tracing::debug;
use transport::TransportKind;

/// Replay and retention policy over the message store.
pub struct StoreForward {
    messages: Arc<dyn MessageStore>,
    peers: Arc<dyn PeerStore>,
    replay_window: Duration,
}

impl StoreForward {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        peers: Arc<dyn PeerStore>,
        replay_window: Duration,
    ) -> Self {
        Self {
            messages,
            peers,
            replay_window,
        }
    }

    /// Packets to re-emit for a peer that just became reachable, paired
    /// with the targeted route when one is known. Messages older than the
    /// replay window stay put until the retention sweep claims them.
    pub async fn pending_packets(
        &self,
        peer_id: &str,
    ) -> Vec<(MeshPacket, Option<String>, Option<TransportKind>)> {
        let pending = match self.messages.undelivered_for_peer(peer_id).await {
            Ok(pending) => pending,
            Err(e) => {
                debug!("undelivered lookup for {} failed: {}", peer_id, e);
                return Vec::new();
            }
        };
        if pending.is_empty() {
            return Vec::new();
        }

        let (endpoint, transport) = match self.peers.get_by_mesh_id(peer_id).await {
            Ok(Some(peer)) if peer.connection_state == ConnectionState::Connected => {
                match peer.transport {
                    Some(kind) => (peer.endpoint_id, Some(kind)),
                    None => (None, None),
                }
            }
            _ => (None, None),
        };

        let cutoff = Utc::now() - self.replay_window;
        pending
            .into_iter()
            .filter(|message| message.received_at >= cutoff)
            .map(|message| {
                (
                    packet_for_replay(&message),
                    endpoint.clone(),
                    transport,
                )
            })
            .collect()
    }

    /// Purge messages past the retention horizon. Returns how many rows
    /// went away.
    pub async fn sweep_retention(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        match self.messages.delete_older_than(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    debug!("retention sweep removed {} message(s)", removed);
                }
                removed
            }
            Err(e) => {
                debug!("retention sweep failed: {}", e);
                0
            }
        }
    }
}

/// Rebuild the wire packet for a stored message. The original packet id
/// and timestamp are preserved; hop bookkeeping restarts at the origin.
fn packet_for_replay(message: &MeshMessage) -> MeshPacket {
    let kind = if message.content_kind == ContentKind::Sos {
        PacketKind::Sos
    } else {
        PacketKind::Message
    };
    MeshPacket {
        packet_id: message.packet_id.clone(),
        version: PROTOCOL_VERSION,
        kind,
        sender_id: message.sender_id.clone(),
        sender_name: message.sender_name.clone(),
        destination_id: message.destination_id.clone(),
        hop_count: 0,
        max_hops: message.max_hops,
        timestamp: message.timestamp.timestamp_millis(),
        previous_hop: String::new(),
        route_path: Vec::new(),
        content_kind: message.content_kind,
        content: message.content.clone(),
        media_info: message.media_info.clone(),
        ack_for_packet_id: None,
    }
}
