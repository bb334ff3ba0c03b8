//! Transport abstraction layer for the mesh messaging core.
//!
//! Every link technology (paired short-range radio, connectionless neighbor
//! discovery, IP-over-P2P, audio-band beacons) implements the [`Transport`]
//! trait and reports inbound traffic through a shared event channel. The
//! [`TransportDispatcher`] owns the active set and presents one send
//! surface to the router.

pub mod audio_beacon;
pub mod direct_ip;
pub mod dispatcher;
pub mod error;
pub mod interface;
pub mod link;
pub mod neighbor_discovery;
pub mod paired_radio;

pub use audio_beacon::AudioBeaconTransport;
pub use direct_ip::DirectIpTransport;
pub use dispatcher::{LinkStatus, TransportDispatcher, TransportState};
pub use error::{TransportError, TransportResult};
pub use interface::{EventSink, Transport, TransportEvent, TransportKind};
pub use link::{LinkDriver, LinkEvent};
pub use neighbor_discovery::NeighborDiscoveryTransport;
pub use paired_radio::PairedRadioTransport;
