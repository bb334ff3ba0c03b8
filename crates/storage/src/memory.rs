//! In-memory reference implementation of the persistence contract
//!
//! Backed by `RwLock<HashMap>` maps; the write lock provides the
//! single-writer-per-row guarantee the contract asks for. Observable
//! queries are served by lazily created `watch` channels refreshed after
//! every mutation that touches their row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::contract::{ConversationStore, MessageStore, PeerStore};
use crate::error::{StorageError, StorageResult};
use crate::models::{ConnectionState, Conversation, MeshMessage, MessageStatus, Peer};

/// In-memory message store.
#[derive(Default)]
pub struct MemoryMessageStore {
    rows: RwLock<HashMap<String, MeshMessage>>,
    watchers: RwLock<HashMap<String, watch::Sender<Vec<MeshMessage>>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversation_rows(
        rows: &HashMap<String, MeshMessage>,
        conversation_id: &str,
    ) -> Vec<MeshMessage> {
        let mut messages: Vec<MeshMessage> = rows
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.packet_id.cmp(&b.packet_id))
        });
        messages
    }

    async fn notify(&self, conversation_id: &str) {
        let watchers = self.watchers.read().await;
        if let Some(sender) = watchers.get(conversation_id) {
            let rows = self.rows.read().await;
            let _ = sender.send(Self::conversation_rows(&rows, conversation_id));
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_ignore(&self, message: &MeshMessage) -> StorageResult<bool> {
        let inserted = {
            let mut rows = self.rows.write().await;
            if rows.contains_key(&message.packet_id) {
                debug!("message {} already stored, ignoring", message.packet_id);
                false
            } else {
                rows.insert(message.packet_id.clone(), message.clone());
                true
            }
        };
        if inserted {
            self.notify(&message.conversation_id).await;
        }
        Ok(inserted)
    }

    async fn exists(&self, packet_id: &str) -> StorageResult<bool> {
        Ok(self.rows.read().await.contains_key(packet_id))
    }

    async fn update_status(&self, packet_id: &str, status: MessageStatus) -> StorageResult<()> {
        let conversation_id = {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(packet_id)
                .ok_or_else(|| StorageError::NotFound(packet_id.to_string()))?;
            row.status = status;
            row.conversation_id.clone()
        };
        self.notify(&conversation_id).await;
        Ok(())
    }

    async fn mark_all_read(&self, conversation_id: &str) -> StorageResult<usize> {
        let changed = {
            let mut rows = self.rows.write().await;
            let mut changed = 0;
            for row in rows.values_mut() {
                if row.conversation_id == conversation_id && !row.is_read {
                    row.is_read = true;
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 {
            self.notify(conversation_id).await;
        }
        Ok(changed)
    }

    async fn undelivered_for_peer(&self, peer_id: &str) -> StorageResult<Vec<MeshMessage>> {
        let rows = self.rows.read().await;
        let mut pending: Vec<MeshMessage> = rows
            .values()
            .filter(|m| m.destination_id == peer_id && m.is_outgoing && !m.status.is_delivered())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(pending)
    }

    async fn relayable_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<MeshMessage>> {
        let rows = self.rows.read().await;
        let mut recent: Vec<MeshMessage> = rows
            .values()
            .filter(|m| m.received_at >= since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(recent)
    }

    async fn get_by_packet_id(&self, packet_id: &str) -> StorageResult<Option<MeshMessage>> {
        Ok(self.rows.read().await.get(packet_id).cloned())
    }

    async fn for_conversation(&self, conversation_id: &str) -> StorageResult<Vec<MeshMessage>> {
        let rows = self.rows.read().await;
        Ok(Self::conversation_rows(&rows, conversation_id))
    }

    async fn observe_conversation(
        &self,
        conversation_id: &str,
    ) -> StorageResult<watch::Receiver<Vec<MeshMessage>>> {
        let mut watchers = self.watchers.write().await;
        if let Some(sender) = watchers.get(conversation_id) {
            return Ok(sender.subscribe());
        }
        let rows = self.rows.read().await;
        let (sender, receiver) = watch::channel(Self::conversation_rows(&rows, conversation_id));
        watchers.insert(conversation_id.to_string(), sender);
        Ok(receiver)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let (removed, touched) = {
            let mut rows = self.rows.write().await;
            let before = rows.len();
            let mut touched: Vec<String> = Vec::new();
            rows.retain(|_, row| {
                let keep = row.received_at >= cutoff;
                if !keep {
                    touched.push(row.conversation_id.clone());
                }
                keep
            });
            (before - rows.len(), touched)
        };
        for conversation_id in touched {
            self.notify(&conversation_id).await;
        }
        Ok(removed)
    }
}

/// In-memory peer store.
#[derive(Default)]
pub struct MemoryPeerStore {
    rows: RwLock<HashMap<String, Peer>>,
    watchers: RwLock<HashMap<String, watch::Sender<Option<Peer>>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, mesh_id: &str) {
        let watchers = self.watchers.read().await;
        if let Some(sender) = watchers.get(mesh_id) {
            let rows = self.rows.read().await;
            let _ = sender.send(rows.get(mesh_id).cloned());
        }
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn upsert(&self, peer: Peer) -> StorageResult<()> {
        let mesh_id = peer.mesh_id.clone();
        self.rows.write().await.insert(mesh_id.clone(), peer);
        self.notify(&mesh_id).await;
        Ok(())
    }

    async fn get_by_mesh_id(&self, mesh_id: &str) -> StorageResult<Option<Peer>> {
        Ok(self.rows.read().await.get(mesh_id).cloned())
    }

    async fn get_by_endpoint_id(&self, endpoint_id: &str) -> StorageResult<Option<Peer>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|p| p.endpoint_id.as_deref() == Some(endpoint_id))
            .cloned())
    }

    async fn update_connection_state(
        &self,
        mesh_id: &str,
        state: ConnectionState,
    ) -> StorageResult<()> {
        {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(mesh_id)
                .ok_or_else(|| StorageError::NotFound(mesh_id.to_string()))?;
            row.connection_state = state;
        }
        self.notify(mesh_id).await;
        Ok(())
    }

    async fn get_connected(&self) -> StorageResult<Vec<Peer>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|p| p.connection_state == ConnectionState::Connected)
            .cloned()
            .collect())
    }

    async fn observe_peer(&self, mesh_id: &str) -> StorageResult<watch::Receiver<Option<Peer>>> {
        let mut watchers = self.watchers.write().await;
        if let Some(sender) = watchers.get(mesh_id) {
            return Ok(sender.subscribe());
        }
        let current = self.rows.read().await.get(mesh_id).cloned();
        let (sender, receiver) = watch::channel(current);
        watchers.insert(mesh_id.to_string(), sender);
        Ok(receiver)
    }

    async fn mark_lost(&self, threshold: DateTime<Utc>) -> StorageResult<usize> {
        let changed: Vec<String> = {
            let mut rows = self.rows.write().await;
            let mut changed = Vec::new();
            for row in rows.values_mut() {
                let fading = matches!(
                    row.connection_state,
                    ConnectionState::Discovered
                        | ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                );
                if fading && row.last_seen < threshold {
                    row.connection_state = ConnectionState::Lost;
                    changed.push(row.mesh_id.clone());
                }
            }
            changed
        };
        for mesh_id in &changed {
            self.notify(mesh_id).await;
        }
        Ok(changed.len())
    }

    async fn disconnect_all(&self) -> StorageResult<usize> {
        let changed: Vec<String> = {
            let mut rows = self.rows.write().await;
            let mut changed = Vec::new();
            for row in rows.values_mut() {
                if row.connection_state != ConnectionState::Disconnected {
                    row.connection_state = ConnectionState::Disconnected;
                    changed.push(row.mesh_id.clone());
                }
            }
            changed
        };
        for mesh_id in &changed {
            self.notify(mesh_id).await;
        }
        Ok(changed.len())
    }
}

/// In-memory conversation store.
#[derive(Default)]
pub struct MemoryConversationStore {
    rows: RwLock<HashMap<String, Conversation>>,
    watchers: RwLock<HashMap<String, watch::Sender<Option<Conversation>>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, id: &str) {
        let watchers = self.watchers.read().await;
        if let Some(sender) = watchers.get(id) {
            let rows = self.rows.read().await;
            let _ = sender.send(rows.get(id).cloned());
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn upsert(&self, conversation: Conversation) -> StorageResult<()> {
        let id = conversation.id.clone();
        self.rows.write().await.insert(id.clone(), conversation);
        self.notify(&id).await;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<Conversation>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn get_by_peer_id(&self, peer_id: &str) -> StorageResult<Option<Conversation>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|c| c.peer_id.as_deref() == Some(peer_id))
            .cloned())
    }

    async fn observe_by_id(
        &self,
        id: &str,
    ) -> StorageResult<watch::Receiver<Option<Conversation>>> {
        let mut watchers = self.watchers.write().await;
        if let Some(sender) = watchers.get(id) {
            return Ok(sender.subscribe());
        }
        let current = self.rows.read().await.get(id).cloned();
        let (sender, receiver) = watch::channel(current);
        watchers.insert(id.to_string(), sender);
        Ok(receiver)
    }

    async fn update_last_message(
        &self,
        id: &str,
        preview: &str,
        timestamp: DateTime<Utc>,
        increment_unread: bool,
    ) -> StorageResult<()> {
        {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
            row.last_message_preview = preview.to_string();
            row.last_message_time = Some(timestamp);
            row.updated_at = timestamp;
            if increment_unread {
                row.unread_count += 1;
            }
        }
        self.notify(id).await;
        Ok(())
    }

    async fn clear_unread(&self, id: &str) -> StorageResult<()> {
        {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
            row.unread_count = 0;
        }
        self.notify(id).await;
        Ok(())
    }
}
