//! The mesh packet envelope and its field types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Destination sentinel addressing every reachable peer.
pub const BROADCAST_DEST: &str = "BROADCAST";

/// Destination sentinel for emergency broadcasts.
pub const SOS_BROADCAST_DEST: &str = "SOS_BROADCAST";

/// Default hop budget for a freshly minted packet.
pub const DEFAULT_MAX_HOPS: u8 = 7;

/// Wire protocol version stamped on every packet we originate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet kinds carried on the wire.
///
/// Kinds we do not recognize decode to [`PacketKind::Unknown`] instead of
/// failing the whole packet; the router decides what to do with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PacketKind {
    Message,
    Ack,
    PeerAnnounce,
    PeerLeave,
    Ping,
    Pong,
    RouteRequest,
    RouteReply,
    MediaChunk,
    Sos,
    RelayTable,
    Unknown,
}

impl PacketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Message => "message",
            PacketKind::Ack => "ack",
            PacketKind::PeerAnnounce => "peer_announce",
            PacketKind::PeerLeave => "peer_leave",
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
            PacketKind::RouteRequest => "route_request",
            PacketKind::RouteReply => "route_reply",
            PacketKind::MediaChunk => "media_chunk",
            PacketKind::Sos => "sos",
            PacketKind::RelayTable => "relay_table",
            PacketKind::Unknown => "unknown",
        }
    }
}

impl From<String> for PacketKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "message" => PacketKind::Message,
            "ack" => PacketKind::Ack,
            "peer_announce" => PacketKind::PeerAnnounce,
            "peer_leave" => PacketKind::PeerLeave,
            "ping" => PacketKind::Ping,
            "pong" => PacketKind::Pong,
            "route_request" => PacketKind::RouteRequest,
            "route_reply" => PacketKind::RouteReply,
            "media_chunk" => PacketKind::MediaChunk,
            "sos" => PacketKind::Sos,
            "relay_table" => PacketKind::RelayTable,
            _ => PacketKind::Unknown,
        }
    }
}

impl From<PacketKind> for String {
    fn from(kind: PacketKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the `content` field of a packet holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentKind {
    Text,
    Audio,
    Image,
    File,
    Location,
    Ack,
    PeerAnnounce,
    Ping,
    Sos,
    Unknown,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Audio => "audio",
            ContentKind::Image => "image",
            ContentKind::File => "file",
            ContentKind::Location => "location",
            ContentKind::Ack => "ack",
            ContentKind::PeerAnnounce => "peer_announce",
            ContentKind::Ping => "ping",
            ContentKind::Sos => "sos",
            ContentKind::Unknown => "unknown",
        }
    }
}

impl From<String> for ContentKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => ContentKind::Text,
            "audio" => ContentKind::Audio,
            "image" => ContentKind::Image,
            "file" => ContentKind::File,
            "location" => ContentKind::Location,
            "ack" => ContentKind::Ack,
            "peer_announce" => ContentKind::PeerAnnounce,
            "ping" => ContentKind::Ping,
            "sos" => ContentKind::Sos,
            _ => ContentKind::Unknown,
        }
    }
}

impl From<ContentKind> for String {
    fn from(kind: ContentKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata describing a media payload or chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub checksum: String,
}

/// The sole wire-level envelope exchanged between nodes.
///
/// `packet_id` is set once at origin and preserved through every forward;
/// `sender_id` is never mutated; `route_path` is append-only and excludes
/// the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub packet_id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub kind: PacketKind,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub destination_id: String,
    #[serde(default)]
    pub hop_count: u8,
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    /// Originator wall clock, epoch milliseconds.
    pub timestamp: i64,
    /// Identity of the last forwarder; empty at origin.
    #[serde(default)]
    pub previous_hop: String,
    /// Identities that have forwarded this packet, in order.
    #[serde(default)]
    pub route_path: Vec<String>,
    pub content_kind: ContentKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_info: Option<MediaInfo>,
    #[serde(default)]
    pub ack_for_packet_id: Option<String>,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_max_hops() -> u8 {
    DEFAULT_MAX_HOPS
}

impl MeshPacket {
    /// Create a packet at its origin with a fresh id and hop count zero.
    pub fn new(
        kind: PacketKind,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        destination_id: impl Into<String>,
        content_kind: ContentKind,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            packet_id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            kind,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            destination_id: destination_id.into(),
            hop_count: 0,
            max_hops: DEFAULT_MAX_HOPS,
            timestamp,
            previous_hop: String::new(),
            route_path: Vec::new(),
            content_kind,
            content: content.into(),
            media_info: None,
            ack_for_packet_id: None,
        }
    }

    /// True once the packet has consumed its entire hop budget.
    pub fn is_expired(&self) -> bool {
        self.hop_count >= self.max_hops
    }

    /// True when addressed to the general or emergency broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        self.destination_id == BROADCAST_DEST || self.destination_id == SOS_BROADCAST_DEST
    }

    /// True when this packet has already traversed `mesh_id`, either as
    /// origin or as a forwarder.
    pub fn has_traversed(&self, mesh_id: &str) -> bool {
        self.sender_id == mesh_id || self.route_path.iter().any(|hop| hop == mesh_id)
    }

    /// Build the copy of this packet a forwarder emits: hop count
    /// incremented, `previous_hop` set to the forwarder, the forwarder
    /// appended to `route_path`, every other field untouched.
    pub fn forwarded(&self, local_mesh_id: &str) -> MeshPacket {
        let mut next = self.clone();
        next.hop_count = self.hop_count.saturating_add(1);
        next.previous_hop = local_mesh_id.to_string();
        next.route_path.push(local_mesh_id.to_string());
        next
    }
}
