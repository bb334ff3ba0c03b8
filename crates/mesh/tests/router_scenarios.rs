//! Multi-node routing scenarios, run against the in-memory stores with a
//! capturing send handle per node. Packets are shuttled between nodes by
//! hand so every hop is observable.

use std::sync::Arc;

use chrono::Utc;
use mesh::{MeshEvent, MeshRouter, SeenPacketCache, StatusBus, StoreForward};
use protocol::{
    ContentKind, MeshPacket, PacketKind, PeerAnnouncement, BROADCAST_DEST, SOS_BROADCAST_DEST,
};
use storage::{
    MemoryConversationStore, MemoryMessageStore, MemoryPeerStore, MessageStatus, MessageStore,
    PeerStore, BROADCAST_CONVERSATION_ID,
};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use transport::TransportKind;

type Outbox = Arc<Mutex<Vec<(MeshPacket, Option<String>, Option<TransportKind>)>>>;

struct Node {
    router: Arc<MeshRouter>,
    messages: Arc<MemoryMessageStore>,
    peers: Arc<MemoryPeerStore>,
    events: broadcast::Receiver<MeshEvent>,
    outbox: Outbox,
}

async fn node(mesh_id: &str, name: &str) -> Node {
    let messages = Arc::new(MemoryMessageStore::new());
    let peers = Arc::new(MemoryPeerStore::new());
    let conversations = Arc::new(MemoryConversationStore::new());
    let bus = Arc::new(StatusBus::new());
    let events = bus.subscribe_events();
    let router = Arc::new(MeshRouter::new(
        mesh_id,
        name,
        7,
        Arc::new(SeenPacketCache::new()),
        messages.clone() as Arc<dyn MessageStore>,
        peers.clone() as Arc<dyn PeerStore>,
        conversations,
        bus,
        StoreForward::new(
            messages.clone() as Arc<dyn MessageStore>,
            peers.clone() as Arc<dyn PeerStore>,
            chrono::Duration::hours(24),
        ),
    ));
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outbox);
    router
        .set_outbound(Arc::new(move |packet, endpoint, kind| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().await.push((packet, endpoint, kind));
            })
        }))
        .await;
    Node {
        router,
        messages,
        peers,
        events,
        outbox,
    }
}

async fn drain(node: &Node) -> Vec<MeshPacket> {
    node.outbox
        .lock()
        .await
        .drain(..)
        .map(|(packet, _, _)| packet)
        .collect()
}

async fn receive(node: &Node, packet: &MeshPacket) {
    node.router
        .on_packet_received(packet.clone(), "test-ep", TransportKind::NeighborDiscovery)
        .await;
}

fn drain_events(node: &mut Node) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn scenario_self_loop_suppression() {
    let mut a = node("aaa", "Alice").await;
    let b = node("bbb", "Bob").await;
    let c = node("ccc", "Cara").await;

    // A originates a directed message to C.
    let sent = a
        .router
        .send_message("ccc", "hello cara", ContentKind::Text, None)
        .await
        .unwrap();
    let a_out = drain(&a).await;
    assert_eq!(a_out.len(), 1);
    let p1 = &a_out[0];
    assert_eq!(p1.packet_id, sent.packet_id);
    assert_eq!(p1.hop_count, 0);

    // B relays it.
    receive(&b, p1).await;
    let b_out = drain(&b).await;
    assert_eq!(b_out.len(), 1);
    let relayed = &b_out[0];
    assert_eq!(relayed.hop_count, 1);
    assert_eq!(relayed.route_path, vec!["bbb".to_string()]);

    // C delivers exactly once and emits an ACK back to A.
    receive(&c, relayed).await;
    let c_out = drain(&c).await;
    assert_eq!(c_out.len(), 1);
    let ack = &c_out[0];
    assert_eq!(ack.kind, PacketKind::Ack);
    assert_eq!(ack.destination_id, "aaa");
    let persisted = c.messages.get_by_packet_id(&p1.packet_id).await.unwrap();
    assert!(persisted.is_some());

    // The relayed copy echoes back to A: route_path already carries the
    // origin, so A drops it without emitting anything.
    receive(&a, relayed).await;
    assert!(drain(&a).await.is_empty());

    // The ACK travels back through B to A.
    receive(&b, ack).await;
    let b_out = drain(&b).await;
    assert_eq!(b_out.len(), 1);
    receive(&a, &b_out[0]).await;

    let stored = a
        .messages
        .get_by_packet_id(&sent.packet_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);

    let delivered: Vec<MeshEvent> = drain_events(&mut a)
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::MessageDelivered { .. }))
        .collect();
    assert_eq!(delivered.len(), 1);
}

#[tokio::test]
async fn scenario_ttl_expiry() {
    let b = node("bbb", "Bob").await;
    let c = node("ccc", "Cara").await;

    // Hand-built packet with a two-hop budget, addressed past C.
    let mut packet = MeshPacket::new(
        PacketKind::Message,
        "aaa",
        "Alice",
        "ddd",
        ContentKind::Text,
        "short fuse",
        Utc::now().timestamp_millis(),
    );
    packet.max_hops = 2;

    receive(&b, &packet).await;
    let b_out = drain(&b).await;
    assert_eq!(b_out.len(), 1);
    assert_eq!(b_out[0].hop_count, 1);

    // C would mint hop 2 == max_hops; nothing may be emitted, so the
    // packet dies here and D never sees it.
    receive(&c, &b_out[0]).await;
    assert!(drain(&c).await.is_empty());
}

#[tokio::test]
async fn scenario_ttl_expiry_still_delivers_at_destination() {
    let b = node("bbb", "Bob").await;
    let c = node("ccc", "Cara").await;

    let mut packet = MeshPacket::new(
        PacketKind::Message,
        "aaa",
        "Alice",
        "ccc",
        ContentKind::Text,
        "just in time",
        Utc::now().timestamp_millis(),
    );
    packet.max_hops = 2;

    receive(&b, &packet).await;
    let b_out = drain(&b).await;
    receive(&c, &b_out[0]).await;

    // Delivered at the final allowed hop; only the ACK goes out.
    assert!(c
        .messages
        .get_by_packet_id(&packet.packet_id)
        .await
        .unwrap()
        .is_some());
    let c_out = drain(&c).await;
    assert_eq!(c_out.len(), 1);
    assert_eq!(c_out[0].kind, PacketKind::Ack);
}

#[tokio::test]
async fn scenario_broadcast_fan_out() {
    let a = node("aaa", "Alice").await;
    let b = node("bbb", "Bob").await;
    let c = node("ccc", "Cara").await;

    a.router
        .send_message(BROADCAST_DEST, "hello everyone", ContentKind::Text, None)
        .await
        .unwrap();
    let a_out = drain(&a).await;
    let original = &a_out[0];

    // B and C each deliver once and forward once.
    receive(&b, original).await;
    receive(&c, original).await;
    let b_out = drain(&b).await;
    let c_out = drain(&c).await;
    assert_eq!(b_out.len(), 1);
    assert_eq!(c_out.len(), 1);
    assert_eq!(
        b.messages
            .for_conversation(BROADCAST_CONVERSATION_ID)
            .await
            .unwrap()
            .len(),
        1
    );

    // C also hears B's forward: duplicate, dropped.
    receive(&c, &b_out[0]).await;
    assert!(drain(&c).await.is_empty());
    assert_eq!(
        c.messages
            .for_conversation(BROADCAST_CONVERSATION_ID)
            .await
            .unwrap()
            .len(),
        1
    );

    // A hears the echo of its own broadcast: the seen cache holds the
    // packet id, so it is dropped.
    receive(&a, &b_out[0]).await;
    assert!(drain(&a).await.is_empty());
}

#[tokio::test]
async fn scenario_store_and_forward() {
    let mut a = node("aaa", "Alice").await;

    // D is absent; the message is persisted and fanned out into the void.
    let queued = a
        .router
        .send_message("ddd", "see you soon", ContentKind::Text, None)
        .await
        .unwrap();
    assert_eq!(queued.status, MessageStatus::Sent);
    drain(&a).await;

    // Later, D's announcement reaches A directly (hop 0).
    let announcement = PeerAnnouncement::new("ddd", "Dana");
    let announce_packet = MeshPacket::new(
        PacketKind::PeerAnnounce,
        "ddd",
        "Dana",
        BROADCAST_DEST,
        ContentKind::PeerAnnounce,
        announcement.to_content().unwrap(),
        Utc::now().timestamp_millis(),
    );
    a.router
        .on_packet_received(announce_packet, "ep-dana", TransportKind::DirectIp)
        .await;

    // A re-emits the stored message, original id preserved, targeted at
    // D's now-known transport and endpoint.
    let replays: Vec<_> = a
        .outbox
        .lock()
        .await
        .drain(..)
        .filter(|(p, _, _)| p.kind == PacketKind::Message)
        .collect();
    assert_eq!(replays.len(), 1);
    let (replayed, endpoint, transport) = &replays[0];
    assert_eq!(replayed.packet_id, queued.packet_id);
    assert_eq!(endpoint.as_deref(), Some("ep-dana"));
    assert_eq!(*transport, Some(TransportKind::DirectIp));

    // D's ACK closes the loop.
    let mut ack = MeshPacket::new(
        PacketKind::Ack,
        "ddd",
        "Dana",
        "aaa",
        ContentKind::Ack,
        "",
        Utc::now().timestamp_millis(),
    );
    ack.ack_for_packet_id = Some(queued.packet_id.clone());
    receive(&a, &ack).await;

    let stored = a
        .messages
        .get_by_packet_id(&queued.packet_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);
    let delivered: Vec<_> = drain_events(&mut a)
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::MessageDelivered { .. }))
        .collect();
    assert_eq!(delivered.len(), 1);
}

#[tokio::test]
async fn scenario_sos_unconditional_propagation() {
    let a = node("aaa", "Alice").await;
    let mut b = node("bbb", "Bob").await;
    let mut c = node("ccc", "Cara").await;

    a.router.send_sos("trapped at ridge").await.unwrap();
    let a_out = drain(&a).await;
    let sos = &a_out[0];
    assert_eq!(sos.kind, PacketKind::Sos);
    assert_eq!(sos.destination_id, SOS_BROADCAST_DEST);

    receive(&b, sos).await;
    let b_out = drain(&b).await;
    assert_eq!(b_out.len(), 1, "SOS must be forwarded");

    receive(&c, &b_out[0]).await;
    let c_out = drain(&c).await;
    assert_eq!(c_out.len(), 1);

    for node in [&mut b, &mut c] {
        let sos_events: Vec<_> = drain_events(node)
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::SosReceived { .. }))
            .collect();
        assert_eq!(sos_events.len(), 1);
    }
}

#[tokio::test]
async fn scenario_sos_with_arbitrary_destination_still_propagates() {
    let mut b = node("bbb", "Bob").await;

    let packet = MeshPacket::new(
        PacketKind::Sos,
        "aaa",
        "Alice",
        "not-a-sentinel",
        ContentKind::Sos,
        "mayday",
        Utc::now().timestamp_millis(),
    );
    receive(&b, &packet).await;

    assert_eq!(drain(&b).await.len(), 1);
    let sos_events: Vec<_> = drain_events(&mut b)
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::SosReceived { .. }))
        .collect();
    assert_eq!(sos_events.len(), 1);
}

#[tokio::test]
async fn forwarded_packets_preserve_everything_but_hop_bookkeeping() {
    let b = node("bbb", "Bob").await;

    let mut packet = MeshPacket::new(
        PacketKind::Message,
        "aaa",
        "Alice",
        "zzz",
        ContentKind::Text,
        "payload",
        1_700_000_000_000,
    );
    packet.route_path = vec!["rrr".to_string()];
    packet.previous_hop = "rrr".to_string();
    packet.hop_count = 1;

    receive(&b, &packet).await;
    let out = drain(&b).await;
    assert_eq!(out.len(), 1);
    let forwarded = &out[0];

    assert_eq!(forwarded.hop_count, packet.hop_count + 1);
    assert_eq!(forwarded.previous_hop, "bbb");
    assert_eq!(
        forwarded.route_path,
        vec!["rrr".to_string(), "bbb".to_string()]
    );
    assert_eq!(forwarded.packet_id, packet.packet_id);
    assert_eq!(forwarded.sender_id, packet.sender_id);
    assert_eq!(forwarded.sender_name, packet.sender_name);
    assert_eq!(forwarded.destination_id, packet.destination_id);
    assert_eq!(forwarded.timestamp, packet.timestamp);
    assert_eq!(forwarded.content, packet.content);
    assert_eq!(forwarded.max_hops, packet.max_hops);
}

#[tokio::test]
async fn peer_leave_marks_peer_disconnected_and_forwards() {
    let b = node("bbb", "Bob").await;

    // B knows A from a hop-0 announcement.
    let announcement = PeerAnnouncement::new("aaa", "Alice");
    let announce = MeshPacket::new(
        PacketKind::PeerAnnounce,
        "aaa",
        "Alice",
        BROADCAST_DEST,
        ContentKind::PeerAnnounce,
        announcement.to_content().unwrap(),
        Utc::now().timestamp_millis(),
    );
    receive(&b, &announce).await;
    drain(&b).await;

    let leave = MeshPacket::new(
        PacketKind::PeerLeave,
        "aaa",
        "Alice",
        BROADCAST_DEST,
        ContentKind::Text,
        "",
        Utc::now().timestamp_millis(),
    );
    receive(&b, &leave).await;

    let peer = b.peers.get_by_mesh_id("aaa").await.unwrap().unwrap();
    assert_eq!(
        peer.connection_state,
        storage::ConnectionState::Disconnected
    );
    assert_eq!(drain(&b).await.len(), 1, "leave is forwarded");
}
