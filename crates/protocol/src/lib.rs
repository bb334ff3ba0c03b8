//! Wire-level data model and packet codec for the mesh messaging core.
//!
//! This crate is pure: no I/O, no background tasks. It defines the
//! [`MeshPacket`] envelope every transport carries, the peer announcement
//! payload, and the self-describing byte codec with forward-compatible
//! decoding.

pub mod announcement;
pub mod codec;
pub mod error;
pub mod packet;

pub use announcement::PeerAnnouncement;
pub use codec::{decode, encode, MAX_MEDIA_PACKET_BYTES, MAX_PACKET_BYTES};
pub use error::{CodecError, ProtocolResult};
pub use packet::{
    ContentKind, MediaInfo, MeshPacket, PacketKind, BROADCAST_DEST, DEFAULT_MAX_HOPS,
    PROTOCOL_VERSION, SOS_BROADCAST_DEST,
};
