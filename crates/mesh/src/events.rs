//! Status bus: asynchronous event streams published to consumers
//!
//! Two broadcast streams (newly delivered messages, status updates) with
//! fixed overflow buffers; lagging subscribers lose the oldest buffered
//! events, the publisher never blocks. Link status is a latest-value
//! `watch` cell owned by the dispatcher and re-exposed by the service.

use storage::{MeshMessage, Peer};
use tokio::sync::broadcast;
use tracing::trace;

/// Overflow buffer for the incoming-message stream.
pub const INCOMING_BUFFER: usize = 64;

/// Overflow buffer for the status-update stream.
pub const STATUS_BUFFER: usize = 16;

/// Everything the router reports to the outside world.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    MessageReceived(MeshMessage),
    MessageDelivered { packet_id: String },
    PeerDiscovered(Peer),
    PeerConnected(Peer),
    PeerDisconnected(Peer),
    SosReceived { sender_name: String, message: String },
    Error { message: String },
}

/// Publisher side of the status bus.
pub struct StatusBus {
    incoming_tx: broadcast::Sender<MeshMessage>,
    events_tx: broadcast::Sender<MeshEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(INCOMING_BUFFER);
        let (events_tx, _) = broadcast::channel(STATUS_BUFFER);
        Self {
            incoming_tx,
            events_tx,
        }
    }

    pub fn subscribe_incoming(&self) -> broadcast::Receiver<MeshMessage> {
        self.incoming_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    /// Publish a newly delivered inbound message. Never blocks; a send
    /// with no subscribers is fine.
    pub fn publish_incoming(&self, message: MeshMessage) {
        if self.incoming_tx.send(message).is_err() {
            trace!("no subscribers on incoming stream");
        }
    }

    /// Publish a status update. Never blocks.
    pub fn publish(&self, event: MeshEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers on status stream");
        }
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
