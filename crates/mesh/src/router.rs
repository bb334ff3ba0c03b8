//! Mesh router: routing decisions, persistence writes, envelope
//! construction
//!
//! Every inbound packet runs the same pipeline: duplicate suppression,
//! TTL gate, loop gate, then kind-specific handling. The router never
//! holds a transport reference; it owns an outbound send handle wired in
//! once after construction, which keeps the router/dispatcher relation
//! acyclic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use protocol::{
    ContentKind, MediaInfo, MeshPacket, PacketKind, PeerAnnouncement, BROADCAST_DEST,
    SOS_BROADCAST_DEST,
};
use storage::{
    message_preview, ConnectionState, Conversation, ConversationStore, MeshMessage, MessageStatus,
    MessageStore, Peer, PeerStore, BROADCAST_CONVERSATION_ID,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use transport::{TransportEvent, TransportKind};

use crate::error::MeshResult;
use crate::events::{MeshEvent, StatusBus};
use crate::seen_cache::SeenPacketCache;
use crate::store_forward::StoreForward;

/// Outbound send callback: packet, optional endpoint, optional transport.
/// Wired to the dispatcher once after construction.
pub type SendHandle = Arc<
    dyn Fn(MeshPacket, Option<String>, Option<TransportKind>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// The routing brain of the mesh core.
pub struct MeshRouter {
    local_mesh_id: String,
    local_display_name: String,
    max_hops: u8,
    seen: Arc<SeenPacketCache>,
    messages: Arc<dyn MessageStore>,
    peers: Arc<dyn PeerStore>,
    conversations: Arc<dyn ConversationStore>,
    bus: Arc<StatusBus>,
    store_forward: StoreForward,
    outbound: RwLock<Option<SendHandle>>,
}

impl MeshRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_mesh_id: impl Into<String>,
        local_display_name: impl Into<String>,
        max_hops: u8,
        seen: Arc<SeenPacketCache>,
        messages: Arc<dyn MessageStore>,
        peers: Arc<dyn PeerStore>,
        conversations: Arc<dyn ConversationStore>,
        bus: Arc<StatusBus>,
        store_forward: StoreForward,
    ) -> Self {
        let local_mesh_id = local_mesh_id.into();
        info!("mesh router initialized for {}", local_mesh_id);
        Self {
            local_mesh_id,
            local_display_name: local_display_name.into(),
            max_hops,
            seen,
            messages,
            peers,
            conversations,
            bus,
            store_forward,
            outbound: RwLock::new(None),
        }
    }

    pub fn local_mesh_id(&self) -> &str {
        &self.local_mesh_id
    }

    /// Install the outbound send handle. Called once during wiring.
    pub async fn set_outbound(&self, handle: SendHandle) {
        *self.outbound.write().await = Some(handle);
    }

    async fn emit(
        &self,
        packet: MeshPacket,
        endpoint_id: Option<String>,
        transport: Option<TransportKind>,
    ) {
        let handle = self.outbound.read().await.clone();
        match handle {
            Some(send) => send(packet, endpoint_id, transport).await,
            None => warn!("outbound handle not wired, dropping {}", packet_label(&packet)),
        }
    }

    fn report_error(&self, context: &str, error: impl std::fmt::Display) {
        warn!("{}: {}", context, error);
        self.bus.publish(MeshEvent::Error {
            message: format!("{}: {}", context, error),
        });
    }

    /// Targeted route for a destination: its recorded transport and
    /// endpoint when the peer is connected, otherwise fan-out.
    async fn route_for(&self, destination_id: &str) -> (Option<String>, Option<TransportKind>) {
        if destination_id == BROADCAST_DEST || destination_id == SOS_BROADCAST_DEST {
            return (None, None);
        }
        match self.peers.get_by_mesh_id(destination_id).await {
            Ok(Some(peer)) if peer.connection_state == ConnectionState::Connected => {
                match peer.transport {
                    Some(kind) => (peer.endpoint_id, Some(kind)),
                    None => (None, None),
                }
            }
            _ => (None, None),
        }
    }

    /// Entry point for everything the dispatcher pumps our way.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PacketReceived {
                packet,
                endpoint_id,
                transport,
            } => self.on_packet_received(packet, &endpoint_id, transport).await,
            TransportEvent::PeerConnected {
                endpoint_id,
                mesh_id,
                display_name,
                transport,
            } => {
                self.on_peer_connected(&mesh_id, &endpoint_id, &display_name, transport)
                    .await
            }
            TransportEvent::PeerDisconnected { endpoint_id, .. } => {
                self.on_peer_disconnected(&endpoint_id).await
            }
        }
    }

    /// The inbound pipeline: duplicate, TTL, and loop gates, then
    /// kind-specific dispatch.
    pub async fn on_packet_received(
        &self,
        packet: MeshPacket,
        endpoint_id: &str,
        transport: TransportKind,
    ) {
        if self.seen.contains(&packet.packet_id) {
            debug!("duplicate {} dropped", packet_label(&packet));
            return;
        }
        self.seen.insert(&packet.packet_id);

        if packet.hop_count >= packet.max_hops {
            debug!("expired {} dropped", packet_label(&packet));
            return;
        }
        if packet.has_traversed(&self.local_mesh_id) {
            debug!("looping {} dropped", packet_label(&packet));
            return;
        }

        match packet.kind {
            PacketKind::Message | PacketKind::MediaChunk => self.handle_message(packet).await,
            PacketKind::Ack => self.handle_ack(packet).await,
            PacketKind::PeerAnnounce => {
                self.handle_announce(packet, endpoint_id, transport).await
            }
            PacketKind::PeerLeave => self.handle_peer_leave(packet).await,
            PacketKind::Ping => self.handle_ping(packet).await,
            PacketKind::Pong => self.handle_pong(packet).await,
            PacketKind::Sos => self.handle_sos(packet).await,
            PacketKind::RouteRequest => self.handle_route_request(packet).await,
            PacketKind::RouteReply => self.handle_route_reply(packet).await,
            PacketKind::RelayTable => self.handle_relay_table(packet).await,
            PacketKind::Unknown => {
                debug!("unknown kind on {} dropped", packet_label(&packet));
            }
        }
    }

    async fn handle_message(&self, packet: MeshPacket) {
        let for_us = packet.destination_id == self.local_mesh_id;
        let broadcast = packet.is_broadcast();

        if for_us || broadcast {
            self.deliver(&packet).await;
        }
        if for_us && !broadcast {
            self.send_ack(&packet).await;
        } else {
            self.forward(&packet).await;
        }
    }

    async fn handle_ack(&self, packet: MeshPacket) {
        if packet.destination_id != self.local_mesh_id {
            self.forward(&packet).await;
            return;
        }
        let Some(ack_for) = packet.ack_for_packet_id.clone() else {
            debug!("ack {} carries no reference, dropped", packet.packet_id);
            return;
        };
        match self
            .messages
            .update_status(&ack_for, MessageStatus::Delivered)
            .await
        {
            Ok(()) => {
                debug!("message {} acknowledged by {}", ack_for, packet.sender_id);
                self.bus.publish(MeshEvent::MessageDelivered {
                    packet_id: ack_for,
                });
            }
            Err(storage::StorageError::NotFound(_)) => {
                debug!("ack for unknown message {}", ack_for);
            }
            Err(e) => self.report_error("ack status update failed", e),
        }
    }

    async fn handle_announce(
        &self,
        packet: MeshPacket,
        endpoint_id: &str,
        transport: TransportKind,
    ) {
        let Some(announcement) = PeerAnnouncement::from_content(&packet.content) else {
            debug!("malformed announcement from {} dropped", packet.sender_id);
            return;
        };
        let now = Utc::now();
        let adjacent = packet.hop_count == 0;

        let mut peer = match self.peers.get_by_mesh_id(&announcement.mesh_id).await {
            Ok(Some(existing)) => existing,
            _ => Peer::discovered(&announcement.mesh_id, &announcement.display_name, now),
        };
        if !announcement.display_name.is_empty() {
            peer.display_name = announcement.display_name.clone();
        }
        peer.device_name = announcement.device_name.clone();
        peer.latitude = announcement.latitude;
        peer.longitude = announcement.longitude;
        peer.hop_distance = packet.hop_count;
        peer.connection_state = if adjacent {
            ConnectionState::Connected
        } else {
            ConnectionState::Discovered
        };
        if adjacent {
            peer.endpoint_id = Some(endpoint_id.to_string());
            peer.transport = Some(transport);
        }
        peer.last_seen = now;

        match self.peers.upsert(peer.clone()).await {
            Ok(()) => self.bus.publish(MeshEvent::PeerDiscovered(peer)),
            Err(e) => self.report_error("peer upsert failed", e),
        }

        self.forward(&packet).await;
        self.replay_undelivered(&announcement.mesh_id).await;
    }

    async fn handle_peer_leave(&self, packet: MeshPacket) {
        match self
            .peers
            .update_connection_state(&packet.sender_id, ConnectionState::Disconnected)
            .await
        {
            Ok(()) => {
                if let Ok(Some(peer)) = self.peers.get_by_mesh_id(&packet.sender_id).await {
                    self.bus.publish(MeshEvent::PeerDisconnected(peer));
                }
            }
            Err(storage::StorageError::NotFound(_)) => {
                debug!("leave from unknown peer {}", packet.sender_id);
            }
            Err(e) => self.report_error("peer leave update failed", e),
        }
        self.forward(&packet).await;
    }

    async fn handle_ping(&self, packet: MeshPacket) {
        if packet.destination_id != self.local_mesh_id {
            self.forward(&packet).await;
            return;
        }
        let mut pong = MeshPacket::new(
            PacketKind::Pong,
            &self.local_mesh_id,
            &self.local_display_name,
            &packet.sender_id,
            ContentKind::Ping,
            "",
            Utc::now().timestamp_millis(),
        );
        pong.max_hops = self.max_hops;
        self.seen.insert(&pong.packet_id);
        let (endpoint, kind) = self.route_for(&pong.destination_id).await;
        self.emit(pong, endpoint, kind).await;
    }

    async fn handle_pong(&self, packet: MeshPacket) {
        // Presence refresh only.
        if let Ok(Some(mut peer)) = self.peers.get_by_mesh_id(&packet.sender_id).await {
            peer.last_seen = Utc::now();
            if let Err(e) = self.peers.upsert(peer).await {
                debug!("pong presence refresh failed: {}", e);
            }
        }
    }

    async fn handle_sos(&self, packet: MeshPacket) {
        // Emergency traffic is treated as always-broadcast: delivered
        // everywhere, forwarded everywhere, whatever the destination says.
        self.deliver(&packet).await;
        let sender_name = if packet.sender_name.is_empty() {
            packet.sender_id.clone()
        } else {
            packet.sender_name.clone()
        };
        self.bus.publish(MeshEvent::SosReceived {
            sender_name,
            message: packet.content.clone(),
        });
        self.forward(&packet).await;
    }

    async fn handle_route_request(&self, packet: MeshPacket) {
        let target = packet.content.trim().to_string();
        if !target.is_empty() {
            if let Ok(Some(peer)) = self.peers.get_by_mesh_id(&target).await {
                if peer.connection_state == ConnectionState::Connected {
                    let mut reply = MeshPacket::new(
                        PacketKind::RouteReply,
                        &self.local_mesh_id,
                        &self.local_display_name,
                        &packet.sender_id,
                        ContentKind::Text,
                        &target,
                        Utc::now().timestamp_millis(),
                    );
                    reply.max_hops = self.max_hops;
                    self.seen.insert(&reply.packet_id);
                    let (endpoint, kind) = self.route_for(&reply.destination_id).await;
                    self.emit(reply, endpoint, kind).await;
                }
            }
        }
        self.forward(&packet).await;
    }

    async fn handle_route_reply(&self, packet: MeshPacket) {
        if packet.destination_id == self.local_mesh_id {
            debug!(
                "route to {} confirmed via {:?}",
                packet.content, packet.route_path
            );
            return;
        }
        self.forward(&packet).await;
    }

    async fn handle_relay_table(&self, packet: MeshPacket) {
        // Advisory: refresh the advertiser's presence and move on.
        debug!("relay table from {} noted", packet.sender_id);
        if let Ok(Some(mut peer)) = self.peers.get_by_mesh_id(&packet.sender_id).await {
            peer.last_seen = Utc::now();
            let _ = self.peers.upsert(peer).await;
        }
    }

    /// Persist an inbound packet as a message, ensure its conversation
    /// exists, refresh the conversation summary, and publish it.
    /// Idempotent on `packet_id`.
    async fn deliver(&self, packet: &MeshPacket) {
        let now = Utc::now();
        let to_broadcast_thread = packet.is_broadcast() || packet.kind == PacketKind::Sos;
        let conversation_id = if to_broadcast_thread {
            BROADCAST_CONVERSATION_ID.to_string()
        } else {
            packet.sender_id.clone()
        };

        match self.conversations.get_by_id(&conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let conversation = if to_broadcast_thread {
                    Conversation::broadcast(now)
                } else {
                    let peer_name = if packet.sender_name.is_empty() {
                        packet.sender_id.clone()
                    } else {
                        packet.sender_name.clone()
                    };
                    Conversation::with_peer(&packet.sender_id, peer_name, now)
                };
                if let Err(e) = self.conversations.upsert(conversation).await {
                    self.report_error("conversation create failed", e);
                    return;
                }
            }
            Err(e) => {
                self.report_error("conversation lookup failed", e);
                return;
            }
        }

        let message = MeshMessage {
            packet_id: packet.packet_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: packet.sender_id.clone(),
            sender_name: packet.sender_name.clone(),
            destination_id: packet.destination_id.clone(),
            content_kind: packet.content_kind,
            content: packet.content.clone(),
            media_info: packet.media_info.clone(),
            timestamp: DateTime::from_timestamp_millis(packet.timestamp).unwrap_or(now),
            received_at: now,
            hop_count: packet.hop_count,
            max_hops: packet.max_hops,
            status: MessageStatus::Delivered,
            is_outgoing: false,
            is_read: false,
        };

        match self.messages.insert_ignore(&message).await {
            Ok(true) => {
                let preview = message_preview(message.content_kind, &message.content);
                if let Err(e) = self
                    .conversations
                    .update_last_message(&conversation_id, &preview, now, true)
                    .await
                {
                    self.report_error("conversation summary update failed", e);
                }
                self.bus.publish_incoming(message.clone());
                self.bus.publish(MeshEvent::MessageReceived(message));
            }
            Ok(false) => debug!("message {} already persisted", packet.packet_id),
            Err(e) => self.report_error("message persist failed", e),
        }
    }

    /// Acknowledge a message that was directed specifically at us.
    async fn send_ack(&self, packet: &MeshPacket) {
        let mut ack = MeshPacket::new(
            PacketKind::Ack,
            &self.local_mesh_id,
            &self.local_display_name,
            &packet.sender_id,
            ContentKind::Ack,
            "",
            Utc::now().timestamp_millis(),
        );
        ack.max_hops = self.max_hops;
        ack.ack_for_packet_id = Some(packet.packet_id.clone());
        self.seen.insert(&ack.packet_id);
        debug!("acking {} to {}", packet.packet_id, packet.sender_id);
        let (endpoint, kind) = self.route_for(&ack.destination_id).await;
        self.emit(ack, endpoint, kind).await;
    }

    /// Forward a packet one hop onward, unless its budget is spent.
    async fn forward(&self, packet: &MeshPacket) {
        let next = packet.forwarded(&self.local_mesh_id);
        if next.is_expired() {
            debug!("hop budget spent, not forwarding {}", packet.packet_id);
            return;
        }
        if let Ok(Some(mut origin)) = self.peers.get_by_mesh_id(&packet.sender_id).await {
            origin.messages_relayed += 1;
            if let Err(e) = self.peers.upsert(origin).await {
                debug!("relay counter update failed: {}", e);
            }
        }
        debug!(
            "forwarding {} at hop {}/{}",
            next.packet_id, next.hop_count, next.max_hops
        );
        let (endpoint, kind) = self.route_for(&next.destination_id).await;
        self.emit(next, endpoint, kind).await;
    }

    /// Application-facing send. Persists first, transmits second, then
    /// promotes the stored status to SENT.
    pub async fn send_message(
        &self,
        destination_id: &str,
        content: &str,
        content_kind: ContentKind,
        media_info: Option<MediaInfo>,
    ) -> MeshResult<MeshMessage> {
        let now = Utc::now();
        let broadcast =
            destination_id == BROADCAST_DEST || destination_id == SOS_BROADCAST_DEST;
        let conversation_id = if broadcast {
            BROADCAST_CONVERSATION_ID.to_string()
        } else {
            destination_id.to_string()
        };

        if self
            .conversations
            .get_by_id(&conversation_id)
            .await?
            .is_none()
        {
            let conversation = if broadcast {
                Conversation::broadcast(now)
            } else {
                let peer_name = match self.peers.get_by_mesh_id(destination_id).await? {
                    Some(peer) => peer.display_name,
                    None => destination_id.to_string(),
                };
                Conversation::with_peer(destination_id, peer_name, now)
            };
            self.conversations.upsert(conversation).await?;
        }

        let kind = if content_kind == ContentKind::Sos {
            PacketKind::Sos
        } else {
            PacketKind::Message
        };
        let mut packet = MeshPacket::new(
            kind,
            &self.local_mesh_id,
            &self.local_display_name,
            destination_id,
            content_kind,
            content,
            now.timestamp_millis(),
        );
        packet.max_hops = self.max_hops;
        packet.media_info = media_info.clone();

        let mut message = MeshMessage {
            packet_id: packet.packet_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: self.local_mesh_id.clone(),
            sender_name: self.local_display_name.clone(),
            destination_id: destination_id.to_string(),
            content_kind,
            content: content.to_string(),
            media_info,
            timestamp: now,
            received_at: now,
            hop_count: 0,
            max_hops: self.max_hops,
            status: MessageStatus::Sending,
            is_outgoing: true,
            is_read: true,
        };
        self.messages.insert_ignore(&message).await?;

        let preview = message_preview(content_kind, content);
        self.conversations
            .update_last_message(&conversation_id, &preview, now, false)
            .await?;

        // Our own echo must never be re-processed.
        self.seen.insert(&packet.packet_id);

        let (endpoint, transport) = self.route_for(destination_id).await;
        self.emit(packet, endpoint, transport).await;

        if let Err(e) = self
            .messages
            .update_status(&message.packet_id, MessageStatus::Sent)
            .await
        {
            self.report_error("sent status update failed", e);
        } else {
            message.status = MessageStatus::Sent;
        }
        Ok(message)
    }

    /// Emergency broadcast.
    pub async fn send_sos(&self, message: &str) -> MeshResult<MeshMessage> {
        self.send_message(SOS_BROADCAST_DEST, message, ContentKind::Sos, None)
            .await
    }

    /// Advertise our presence to the whole mesh.
    pub async fn broadcast_peer_announcement(
        &self,
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) {
        let connected_peer_count = match self.peers.get_connected().await {
            Ok(peers) => peers.len() as u32,
            Err(_) => 0,
        };
        let mut announcement =
            PeerAnnouncement::new(&self.local_mesh_id, &self.local_display_name);
        announcement.latitude = latitude;
        announcement.longitude = longitude;
        announcement.connected_peer_count = connected_peer_count;

        let content = match announcement.to_content() {
            Ok(content) => content,
            Err(e) => {
                self.report_error("announcement encode failed", e);
                return;
            }
        };
        let mut packet = MeshPacket::new(
            PacketKind::PeerAnnounce,
            &self.local_mesh_id,
            &self.local_display_name,
            BROADCAST_DEST,
            ContentKind::PeerAnnounce,
            content,
            Utc::now().timestamp_millis(),
        );
        packet.max_hops = self.max_hops;
        self.seen.insert(&packet.packet_id);
        self.emit(packet, None, None).await;
    }

    /// Tell the mesh we are going away. Broadcast before shutdown so
    /// neighbors mark us disconnected right away.
    pub async fn announce_leave(&self) {
        let mut packet = MeshPacket::new(
            PacketKind::PeerLeave,
            &self.local_mesh_id,
            &self.local_display_name,
            BROADCAST_DEST,
            ContentKind::Text,
            "",
            Utc::now().timestamp_millis(),
        );
        packet.max_hops = self.max_hops;
        self.seen.insert(&packet.packet_id);
        self.emit(packet, None, None).await;
    }

    /// Link-level connect hook from a transport.
    pub async fn on_peer_connected(
        &self,
        mesh_id: &str,
        endpoint_id: &str,
        display_name: &str,
        transport: TransportKind,
    ) {
        let now = Utc::now();
        let mut peer = match self.peers.get_by_mesh_id(mesh_id).await {
            Ok(Some(existing)) => existing,
            _ => Peer::discovered(mesh_id, display_name, now),
        };
        peer.connection_state = ConnectionState::Connected;
        peer.endpoint_id = Some(endpoint_id.to_string());
        peer.transport = Some(transport);
        peer.hop_distance = 0;
        peer.last_seen = now;
        if !display_name.is_empty() {
            peer.display_name = display_name.to_string();
        }

        match self.peers.upsert(peer.clone()).await {
            Ok(()) => {
                info!("peer {} connected via {}", mesh_id, transport);
                self.bus.publish(MeshEvent::PeerConnected(peer));
            }
            Err(e) => self.report_error("peer connect upsert failed", e),
        }

        self.replay_undelivered(mesh_id).await;
        self.broadcast_peer_announcement(None, None).await;
    }

    /// Link-level disconnect hook from a transport.
    pub async fn on_peer_disconnected(&self, endpoint_id: &str) {
        match self.peers.get_by_endpoint_id(endpoint_id).await {
            Ok(Some(mut peer)) => {
                if let Err(e) = self
                    .peers
                    .update_connection_state(&peer.mesh_id, ConnectionState::Disconnected)
                    .await
                {
                    self.report_error("peer disconnect update failed", e);
                    return;
                }
                peer.connection_state = ConnectionState::Disconnected;
                info!("peer {} disconnected", peer.mesh_id);
                self.bus.publish(MeshEvent::PeerDisconnected(peer));
            }
            _ => debug!("disconnect for unknown endpoint {}", endpoint_id),
        }
    }

    /// Re-emit stored messages awaiting an offline destination that just
    /// became reachable. Original packet ids are preserved so downstream
    /// deduplication keeps working.
    pub async fn replay_undelivered(&self, peer_id: &str) {
        let batch = self.store_forward.pending_packets(peer_id).await;
        if batch.is_empty() {
            return;
        }
        info!("replaying {} stored message(s) for {}", batch.len(), peer_id);
        for (packet, endpoint, transport) in batch {
            self.emit(packet, endpoint, transport).await;
        }
    }
}

fn packet_label(packet: &MeshPacket) -> String {
    format!("{} ({})", packet.packet_id, packet.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryConversationStore, MemoryMessageStore, MemoryPeerStore};
    use tokio::sync::Mutex;

    type Captured = Arc<Mutex<Vec<(MeshPacket, Option<String>, Option<TransportKind>)>>>;

    struct Harness {
        router: Arc<MeshRouter>,
        messages: Arc<MemoryMessageStore>,
        peers: Arc<MemoryPeerStore>,
        conversations: Arc<MemoryConversationStore>,
        bus: Arc<StatusBus>,
        sent: Captured,
    }

    async fn harness(local_id: &str) -> Harness {
        let messages = Arc::new(MemoryMessageStore::new());
        let peers = Arc::new(MemoryPeerStore::new());
        let conversations = Arc::new(MemoryConversationStore::new());
        let bus = Arc::new(StatusBus::new());
        let seen = Arc::new(SeenPacketCache::new());
        let store_forward = StoreForward::new(
            messages.clone() as Arc<dyn MessageStore>,
            peers.clone() as Arc<dyn PeerStore>,
            chrono::Duration::hours(24),
        );
        let router = Arc::new(MeshRouter::new(
            local_id,
            "Local",
            7,
            seen,
            messages.clone(),
            peers.clone(),
            conversations.clone(),
            bus.clone(),
            store_forward,
        ));
        let sent: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        router
            .set_outbound(Arc::new(move |packet, endpoint, kind| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().await.push((packet, endpoint, kind));
                })
            }))
            .await;
        Harness {
            router,
            messages,
            peers,
            conversations,
            bus,
            sent,
        }
    }

    fn inbound_message(to: &str) -> MeshPacket {
        MeshPacket::new(
            PacketKind::Message,
            "aaa",
            "Alice",
            to,
            ContentKind::Text,
            "hello",
            Utc::now().timestamp_millis(),
        )
    }

    #[tokio::test]
    async fn test_directed_message_delivers_and_acks_without_forward() {
        let h = harness("bbb").await;
        let packet = inbound_message("bbb");
        h.router
            .on_packet_received(packet.clone(), "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let stored = h.messages.get_by_packet_id(&packet.packet_id).await.unwrap();
        assert!(stored.is_some());

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let (ack, _, _) = &sent[0];
        assert_eq!(ack.kind, PacketKind::Ack);
        assert_eq!(ack.destination_id, "aaa");
        assert_eq!(ack.ack_for_packet_id.as_deref(), Some(packet.packet_id.as_str()));
    }

    #[tokio::test]
    async fn test_duplicate_packet_processed_once() {
        let h = harness("bbb").await;
        let packet = inbound_message("bbb");
        for _ in 0..3 {
            h.router
                .on_packet_received(packet.clone(), "ep-1", TransportKind::NeighborDiscovery)
                .await;
        }
        // One persisted message, one ACK.
        assert_eq!(h.sent.lock().await.len(), 1);
        let rows = h.messages.for_conversation("aaa").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_message_forwarded_with_incremented_hop() {
        let h = harness("relay").await;
        let packet = inbound_message("ccc");
        h.router
            .on_packet_received(packet.clone(), "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let (forwarded, _, _) = &sent[0];
        assert_eq!(forwarded.packet_id, packet.packet_id);
        assert_eq!(forwarded.hop_count, packet.hop_count + 1);
        assert_eq!(forwarded.previous_hop, "relay");
        assert_eq!(forwarded.route_path, vec!["relay".to_string()]);
        assert_eq!(forwarded.sender_id, packet.sender_id);
        // Nothing persisted for a packet that is not ours.
        assert!(h
            .messages
            .get_by_packet_id(&packet.packet_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_packet_never_forwarded() {
        let h = harness("relay").await;
        let mut packet = inbound_message("ccc");
        packet.max_hops = 2;
        packet.hop_count = 1;
        // Forwarding would mint hop 2 == max, so nothing may go out.
        h.router
            .on_packet_received(packet, "ep-1", TransportKind::NeighborDiscovery)
            .await;
        assert!(h.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_looped_packet_dropped() {
        let h = harness("relay").await;
        let packet = inbound_message("ccc").forwarded("relay");
        h.router
            .on_packet_received(packet, "ep-1", TransportKind::NeighborDiscovery)
            .await;
        assert!(h.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_own_origin_echo_dropped() {
        let h = harness("aaa").await;
        let packet = inbound_message("ccc").forwarded("bbb");
        assert_eq!(packet.sender_id, "aaa");
        h.router
            .on_packet_received(packet, "ep-1", TransportKind::NeighborDiscovery)
            .await;
        assert!(h.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_and_forwards() {
        let h = harness("bbb").await;
        let packet = inbound_message(BROADCAST_DEST);
        h.router
            .on_packet_received(packet.clone(), "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let rows = h
            .messages
            .for_conversation(BROADCAST_CONVERSATION_ID)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, PacketKind::Message);
        assert_eq!(sent[0].0.hop_count, 1);
        // Broadcast conversation now exists.
        assert!(h
            .conversations
            .get_by_id(BROADCAST_CONVERSATION_ID)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_ack_promotes_message_and_emits_event() {
        let h = harness("aaa").await;
        let mut events = h.bus.subscribe_events();

        let sent_message = h
            .router
            .send_message("bbb", "hi", ContentKind::Text, None)
            .await
            .unwrap();
        assert_eq!(sent_message.status, MessageStatus::Sent);

        let mut ack = MeshPacket::new(
            PacketKind::Ack,
            "bbb",
            "Bob",
            "aaa",
            ContentKind::Ack,
            "",
            Utc::now().timestamp_millis(),
        );
        ack.ack_for_packet_id = Some(sent_message.packet_id.clone());
        h.router
            .on_packet_received(ack, "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let stored = h
            .messages
            .get_by_packet_id(&sent_message.packet_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);

        let mut delivered = false;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::MessageDelivered { packet_id } = event {
                assert_eq!(packet_id, sent_message.packet_id);
                delivered = true;
            }
        }
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_send_message_targets_connected_peer() {
        let h = harness("aaa").await;
        let now = Utc::now();
        let mut peer = Peer::discovered("bbb", "Bob", now);
        peer.connection_state = ConnectionState::Connected;
        peer.endpoint_id = Some("ep-bob".to_string());
        peer.transport = Some(TransportKind::PairedRadio);
        h.peers.upsert(peer).await.unwrap();

        h.router
            .send_message("bbb", "direct", ContentKind::Text, None)
            .await
            .unwrap();

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.as_deref(), Some("ep-bob"));
        assert_eq!(sent[0].2, Some(TransportKind::PairedRadio));
    }

    #[tokio::test]
    async fn test_send_message_fans_out_without_route() {
        let h = harness("aaa").await;
        h.router
            .send_message("offline-peer", "hi", ContentKind::Text, None)
            .await
            .unwrap();
        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, None);
        assert_eq!(sent[0].2, None);
    }

    #[tokio::test]
    async fn test_announce_upserts_peer_and_preserves_flags() {
        let h = harness("bbb").await;
        let now = Utc::now();
        let mut known = Peer::discovered("ddd", "Old Name", now);
        known.is_favorite = true;
        known.messages_relayed = 12;
        let original_color = known.avatar_color.clone();
        h.peers.upsert(known).await.unwrap();

        let announcement = PeerAnnouncement::new("ddd", "Dana");
        let packet = MeshPacket::new(
            PacketKind::PeerAnnounce,
            "ddd",
            "Dana",
            BROADCAST_DEST,
            ContentKind::PeerAnnounce,
            announcement.to_content().unwrap(),
            Utc::now().timestamp_millis(),
        );
        h.router
            .on_packet_received(packet, "ep-d", TransportKind::NeighborDiscovery)
            .await;

        let peer = h.peers.get_by_mesh_id("ddd").await.unwrap().unwrap();
        assert_eq!(peer.display_name, "Dana");
        assert_eq!(peer.connection_state, ConnectionState::Connected);
        assert_eq!(peer.endpoint_id.as_deref(), Some("ep-d"));
        assert_eq!(peer.transport, Some(TransportKind::NeighborDiscovery));
        assert!(peer.is_favorite);
        assert_eq!(peer.messages_relayed, 12);
        assert_eq!(peer.avatar_color, original_color);
    }

    #[tokio::test]
    async fn test_relayed_announce_marks_peer_discovered() {
        let h = harness("bbb").await;
        let announcement = PeerAnnouncement::new("eee", "Eve");
        let packet = MeshPacket::new(
            PacketKind::PeerAnnounce,
            "eee",
            "Eve",
            BROADCAST_DEST,
            ContentKind::PeerAnnounce,
            announcement.to_content().unwrap(),
            Utc::now().timestamp_millis(),
        )
        .forwarded("relay-1");

        h.router
            .on_packet_received(packet, "ep-r", TransportKind::NeighborDiscovery)
            .await;

        let peer = h.peers.get_by_mesh_id("eee").await.unwrap().unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Discovered);
        assert_eq!(peer.hop_distance, 1);
        assert!(peer.endpoint_id.is_none());
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let h = harness("bbb").await;
        let ping = MeshPacket::new(
            PacketKind::Ping,
            "aaa",
            "Alice",
            "bbb",
            ContentKind::Ping,
            "",
            Utc::now().timestamp_millis(),
        );
        h.router
            .on_packet_received(ping, "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, PacketKind::Pong);
        assert_eq!(sent[0].0.destination_id, "aaa");
    }

    #[tokio::test]
    async fn test_sos_always_delivers_and_forwards() {
        let h = harness("bbb").await;
        let mut events = h.bus.subscribe_events();
        // SOS with an arbitrary destination, not a sentinel.
        let packet = MeshPacket::new(
            PacketKind::Sos,
            "aaa",
            "Alice",
            "somewhere-else",
            ContentKind::Sos,
            "need help",
            Utc::now().timestamp_millis(),
        );
        h.router
            .on_packet_received(packet, "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let rows = h
            .messages
            .for_conversation(BROADCAST_CONVERSATION_ID)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, PacketKind::Sos);

        let mut sos_seen = false;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::SosReceived { sender_name, message } = event {
                assert_eq!(sender_name, "Alice");
                assert_eq!(message, "need help");
                sos_seen = true;
            }
        }
        assert!(sos_seen);
    }

    #[tokio::test]
    async fn test_route_request_answered_for_connected_target() {
        let h = harness("bbb").await;
        let now = Utc::now();
        let mut target = Peer::discovered("ccc", "Cara", now);
        target.connection_state = ConnectionState::Connected;
        h.peers.upsert(target).await.unwrap();

        let request = MeshPacket::new(
            PacketKind::RouteRequest,
            "aaa",
            "Alice",
            BROADCAST_DEST,
            ContentKind::Text,
            "ccc",
            Utc::now().timestamp_millis(),
        );
        h.router
            .on_packet_received(request, "ep-1", TransportKind::NeighborDiscovery)
            .await;

        let sent = h.sent.lock().await;
        let kinds: Vec<PacketKind> = sent.iter().map(|(p, _, _)| p.kind).collect();
        assert!(kinds.contains(&PacketKind::RouteReply));
        assert!(kinds.contains(&PacketKind::RouteRequest));
    }

    #[tokio::test]
    async fn test_peer_connect_hook_triggers_replay() {
        let h = harness("aaa").await;
        // Queue a message while the peer is away.
        let queued = h
            .router
            .send_message("ddd", "waiting for you", ContentKind::Text, None)
            .await
            .unwrap();
        h.sent.lock().await.clear();

        h.router
            .on_peer_connected("ddd", "ep-d", "Dana", TransportKind::DirectIp)
            .await;

        let sent = h.sent.lock().await;
        // Replayed message (with its original id) plus our announcement.
        let replayed: Vec<_> = sent
            .iter()
            .filter(|(p, _, _)| p.kind == PacketKind::Message)
            .collect();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0.packet_id, queued.packet_id);
        assert_eq!(replayed[0].1.as_deref(), Some("ep-d"));
        assert_eq!(replayed[0].2, Some(TransportKind::DirectIp));
        assert!(sent
            .iter()
            .any(|(p, _, _)| p.kind == PacketKind::PeerAnnounce));
    }

    #[tokio::test]
    async fn test_disconnect_hook_marks_peer_by_endpoint() {
        let h = harness("aaa").await;
        h.router
            .on_peer_connected("ddd", "ep-d", "Dana", TransportKind::DirectIp)
            .await;
        h.router.on_peer_disconnected("ep-d").await;
        let peer = h.peers.get_by_mesh_id("ddd").await.unwrap().unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_silently_dropped() {
        let h = harness("bbb").await;
        let mut packet = inbound_message("bbb");
        packet.kind = PacketKind::Unknown;
        h.router
            .on_packet_received(packet, "ep-1", TransportKind::NeighborDiscovery)
            .await;
        assert!(h.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_announce_leave_broadcasts_peer_leave() {
        let h = harness("aaa").await;
        h.router.announce_leave().await;
        let sent = h.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, PacketKind::PeerLeave);
        assert_eq!(sent[0].0.destination_id, BROADCAST_DEST);
        assert_eq!(sent[0].1, None);
        assert_eq!(sent[0].2, None);
    }

    #[tokio::test]
    async fn test_send_message_updates_conversation_without_unread() {
        let h = harness("aaa").await;
        h.router
            .send_message("bbb", "first", ContentKind::Text, None)
            .await
            .unwrap();
        let conversation = h.conversations.get_by_id("bbb").await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.last_message_preview, "first");
    }
}
