//! Peer announcement payload carried inside `PEER_ANNOUNCE` packets

use serde::{Deserialize, Serialize};

use crate::packet::PROTOCOL_VERSION;

/// Presence and capability data a node advertises about itself.
///
/// Serialized into the `content` field of a `PEER_ANNOUNCE` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub mesh_id: String,
    pub display_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub connected_peer_count: u32,
    #[serde(default)]
    pub battery_level: Option<u8>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl PeerAnnouncement {
    pub fn new(mesh_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            mesh_id: mesh_id.into(),
            display_name: display_name.into(),
            device_name: String::new(),
            latitude: None,
            longitude: None,
            capabilities: Vec::new(),
            connected_peer_count: 0,
            battery_level: None,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Serialize for embedding in a packet's `content` field.
    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from a packet's `content` field. `None` on malformed payloads.
    pub fn from_content(content: &str) -> Option<Self> {
        serde_json::from_str(content.trim()).ok()
    }
}
