//! Self-describing byte codec for [`MeshPacket`]
//!
//! Packets travel as UTF-8 JSON. The representation is self-delimited at
//! the transport layer (length prefixes or single-payload sessions), so the
//! codec itself only guarantees a stable field set, bounded size, and
//! forward-compatible decoding: unknown fields are ignored, missing
//! optional fields take their defaults, and unrecognized kinds survive as
//! `Unknown` for the router to drop.

use tracing::debug;

use crate::error::{CodecError, ProtocolResult};
use crate::packet::MeshPacket;

/// Upper bound for an encoded packet without media payload.
pub const MAX_PACKET_BYTES: usize = 64 * 1024;

/// Upper bound for an encoded media chunk packet.
pub const MAX_MEDIA_PACKET_BYTES: usize = 256 * 1024;

/// Encode a packet to its wire bytes.
///
/// Fails only when the encoded form exceeds the size bound for its payload
/// class.
pub fn encode(packet: &MeshPacket) -> ProtocolResult<Vec<u8>> {
    let bytes = serde_json::to_vec(packet)?;
    let limit = if packet.media_info.is_some() {
        MAX_MEDIA_PACKET_BYTES
    } else {
        MAX_PACKET_BYTES
    };
    if bytes.len() > limit {
        return Err(CodecError::Oversize {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Decode wire bytes back into a packet.
///
/// Returns `None` on malformed input. Trailing whitespace is tolerated,
/// unknown fields are ignored.
pub fn decode(bytes: &[u8]) -> Option<MeshPacket> {
    let text = std::str::from_utf8(bytes).ok()?;
    match serde_json::from_str::<MeshPacket>(text.trim_end()) {
        Ok(packet) => Some(packet),
        Err(e) => {
            debug!("discarding undecodable packet: {}", e);
            None
        }
    }
}
