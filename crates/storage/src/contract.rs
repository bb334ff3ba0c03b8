//! DAO traits the router drives
//!
//! Implementations must provide single-writer semantics per row; the
//! router relies on `insert_ignore` being idempotent on `packet_id` to
//! absorb duplicate deliveries. Observables are latest-value `watch`
//! receivers so a subscriber always sees at least the most recent state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::StorageResult;
use crate::models::{ConnectionState, Conversation, MeshMessage, MessageStatus, Peer};

/// Message persistence operations.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert unless a row with the same `packet_id` already exists.
    /// Returns whether a row was actually written.
    async fn insert_ignore(&self, message: &MeshMessage) -> StorageResult<bool>;

    async fn exists(&self, packet_id: &str) -> StorageResult<bool>;

    async fn update_status(&self, packet_id: &str, status: MessageStatus) -> StorageResult<()>;

    /// Flag every message in a conversation as read; returns how many rows
    /// changed.
    async fn mark_all_read(&self, conversation_id: &str) -> StorageResult<usize>;

    /// Outgoing messages addressed to `peer_id` that still await delivery
    /// (status outside DELIVERED/READ), oldest first.
    async fn undelivered_for_peer(&self, peer_id: &str) -> StorageResult<Vec<MeshMessage>>;

    /// Messages first seen at or after `since`, oldest first.
    async fn relayable_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<MeshMessage>>;

    async fn get_by_packet_id(&self, packet_id: &str) -> StorageResult<Option<MeshMessage>>;

    /// All messages in a conversation, oldest first.
    async fn for_conversation(&self, conversation_id: &str) -> StorageResult<Vec<MeshMessage>>;

    /// Latest-value view of a conversation's messages.
    async fn observe_conversation(
        &self,
        conversation_id: &str,
    ) -> StorageResult<watch::Receiver<Vec<MeshMessage>>>;

    /// Remove messages first seen before `cutoff`; returns how many rows
    /// were removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

/// Peer persistence operations.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn upsert(&self, peer: Peer) -> StorageResult<()>;

    async fn get_by_mesh_id(&self, mesh_id: &str) -> StorageResult<Option<Peer>>;

    async fn get_by_endpoint_id(&self, endpoint_id: &str) -> StorageResult<Option<Peer>>;

    async fn update_connection_state(
        &self,
        mesh_id: &str,
        state: ConnectionState,
    ) -> StorageResult<()>;

    /// Peers currently in the CONNECTED state.
    async fn get_connected(&self) -> StorageResult<Vec<Peer>>;

    /// Latest-value view of one peer row.
    async fn observe_peer(&self, mesh_id: &str) -> StorageResult<watch::Receiver<Option<Peer>>>;

    /// Mark peers unseen since `threshold` as LOST; returns how many rows
    /// changed.
    async fn mark_lost(&self, threshold: DateTime<Utc>) -> StorageResult<usize>;

    /// Mark every non-disconnected peer DISCONNECTED; returns how many
    /// rows changed.
    async fn disconnect_all(&self) -> StorageResult<usize>;
}

/// Conversation persistence operations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn upsert(&self, conversation: Conversation) -> StorageResult<()>;

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<Conversation>>;

    async fn get_by_peer_id(&self, peer_id: &str) -> StorageResult<Option<Conversation>>;

    /// Latest-value view of one conversation row.
    async fn observe_by_id(
        &self,
        id: &str,
    ) -> StorageResult<watch::Receiver<Option<Conversation>>>;

    /// Refresh the preview/timestamp shown in conversation lists,
    /// optionally bumping the unread counter.
    async fn update_last_message(
        &self,
        id: &str,
        preview: &str,
        timestamp: DateTime<Utc>,
        increment_unread: bool,
    ) -> StorageResult<()>;

    async fn clear_unread(&self, id: &str) -> StorageResult<()>;
}
