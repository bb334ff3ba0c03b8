//! Persisted rows: messages, peers, conversations

use chrono::{DateTime, Utc};
use protocol::{ContentKind, MediaInfo};
use serde::{Deserialize, Serialize};
use transport::TransportKind;

/// The conversation every broadcast message lands in.
pub const BROADCAST_CONVERSATION_ID: &str = "broadcast";

/// Delivery state of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending,
    Sent,
    Relayed,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// True once no further delivery work is owed for this message.
    pub fn is_delivered(self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Read)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Sending => write!(f, "Sending"),
            MessageStatus::Sent => write!(f, "Sent"),
            MessageStatus::Relayed => write!(f, "Relayed"),
            MessageStatus::Delivered => write!(f, "Delivered"),
            MessageStatus::Read => write!(f, "Read"),
            MessageStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Link state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Authenticated,
    Disconnected,
    Lost,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "Discovered"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Lost => write!(f, "Lost"),
        }
    }
}

/// A message as the application sees it. Unique by `packet_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub packet_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub destination_id: String,
    pub content_kind: ContentKind,
    pub content: String,
    pub media_info: Option<MediaInfo>,
    /// Originator wall clock.
    pub timestamp: DateTime<Utc>,
    /// When this node first saw the message.
    pub received_at: DateTime<Utc>,
    pub hop_count: u8,
    pub max_hops: u8,
    pub status: MessageStatus,
    pub is_outgoing: bool,
    pub is_read: bool,
}

/// A known device in the mesh. Unique by `mesh_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub mesh_id: String,
    pub display_name: String,
    pub device_name: String,
    /// Transport-specific handle the peer was last reachable at.
    pub endpoint_id: Option<String>,
    pub connection_state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub signal_strength: Option<i8>,
    /// Hops between us and the peer at its last announcement; 0 when
    /// adjacent.
    pub hop_distance: u8,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub messages_relayed: u64,
    pub is_blocked: bool,
    pub is_favorite: bool,
    pub avatar_color: String,
}

impl Peer {
    /// A freshly discovered peer with every flag at its default.
    pub fn discovered(
        mesh_id: impl Into<String>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mesh_id = mesh_id.into();
        let avatar_color = avatar_color_for(&mesh_id);
        Self {
            mesh_id,
            display_name: display_name.into(),
            device_name: String::new(),
            endpoint_id: None,
            connection_state: ConnectionState::Discovered,
            transport: None,
            signal_strength: None,
            hop_distance: 0,
            latitude: None,
            longitude: None,
            last_seen: now,
            first_seen: now,
            messages_relayed: 0,
            is_blocked: false,
            is_favorite: false,
            avatar_color,
        }
    }
}

/// A message thread with one peer, or the shared broadcast thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub peer_id: Option<String>,
    pub peer_name: String,
    pub last_message_preview: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub is_broadcast: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn with_peer(
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let peer_id = peer_id.into();
        Self {
            id: peer_id.clone(),
            peer_id: Some(peer_id),
            peer_name: peer_name.into(),
            last_message_preview: String::new(),
            last_message_time: None,
            unread_count: 0,
            is_pinned: false,
            is_muted: false,
            is_broadcast: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn broadcast(now: DateTime<Utc>) -> Self {
        Self {
            id: BROADCAST_CONVERSATION_ID.to_string(),
            peer_id: None,
            peer_name: "Broadcast".to_string(),
            last_message_preview: String::new(),
            last_message_time: None,
            unread_count: 0,
            is_pinned: false,
            is_muted: false,
            is_broadcast: true,
            created_at: now,
            updated_at: now,
        }
    }
}

const PREVIEW_MAX_CHARS: usize = 100;

const AVATAR_PALETTE: [&str; 8] = [
    "#e57373", "#ba68c8", "#64b5f6", "#4db6ac", "#81c784", "#ffb74d", "#a1887f", "#90a4ae",
];

/// Deterministic avatar color for a mesh identity.
pub fn avatar_color_for(mesh_id: &str) -> String {
    let sum: usize = mesh_id.bytes().map(usize::from).sum();
    AVATAR_PALETTE[sum % AVATAR_PALETTE.len()].to_string()
}

/// Short symbolic representation of a message for conversation lists.
pub fn message_preview(content_kind: ContentKind, content: &str) -> String {
    let truncated = || {
        let mut preview: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
        if content.chars().count() > PREVIEW_MAX_CHARS {
            preview.push('…');
        }
        preview
    };
    match content_kind {
        ContentKind::Audio => "🎤 Voice message".to_string(),
        ContentKind::Image => "📷 Photo".to_string(),
        ContentKind::File => "📎 File".to_string(),
        ContentKind::Location => "📍 Location".to_string(),
        ContentKind::Sos => format!("🆘 {}", truncated()),
        _ => truncated(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_long_text() {
        let long = "a".repeat(250);
        let preview = message_preview(ContentKind::Text, &long);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_preview_short_text_untouched() {
        assert_eq!(message_preview(ContentKind::Text, "hello"), "hello");
    }

    #[test]
    fn test_preview_symbols_by_kind() {
        assert_eq!(
            message_preview(ContentKind::Audio, "ignored"),
            "🎤 Voice message"
        );
        assert_eq!(message_preview(ContentKind::Image, ""), "📷 Photo");
        assert_eq!(message_preview(ContentKind::File, ""), "📎 File");
        assert_eq!(message_preview(ContentKind::Location, ""), "📍 Location");
        assert_eq!(message_preview(ContentKind::Sos, "help"), "🆘 help");
    }

    #[test]
    fn test_preview_is_char_boundary_safe() {
        let umlauts = "ü".repeat(150);
        let preview = message_preview(ContentKind::Text, &umlauts);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1);
    }

    #[test]
    fn test_avatar_color_is_stable() {
        assert_eq!(avatar_color_for("node-1"), avatar_color_for("node-1"));
        assert!(AVATAR_PALETTE.contains(&avatar_color_for("anything").as_str()));
    }

    #[test]
    fn test_status_delivery_terminal_states() {
        assert!(MessageStatus::Delivered.is_delivered());
        assert!(MessageStatus::Read.is_delivered());
        assert!(!MessageStatus::Sent.is_delivered());
        assert!(!MessageStatus::Sending.is_delivered());
    }
}
