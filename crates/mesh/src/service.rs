//! Top-level mesh service: ownership and wiring
//!
//! One `MeshService` owns the router, the dispatcher, the seen cache, and
//! every background sweeper. The router and dispatcher never reference
//! each other directly; the service hands each a stored callback into the
//! other at start.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use protocol::{ContentKind, MediaInfo};
use storage::{
    Conversation, ConversationStore, MeshMessage, MessageStore, Peer, PeerStore,
};
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};
use transport::{LinkStatus, Transport, TransportDispatcher};

use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::events::{MeshEvent, StatusBus};
use crate::router::MeshRouter;
use crate::seen_cache::SeenPacketCache;
use crate::store_forward::StoreForward;

/// Owns and wires the long-lived mesh subsystems.
pub struct MeshService {
    config: MeshConfig,
    router: Arc<MeshRouter>,
    dispatcher: Arc<TransportDispatcher>,
    seen: Arc<SeenPacketCache>,
    bus: Arc<StatusBus>,
    messages: Arc<dyn MessageStore>,
    peers: Arc<dyn PeerStore>,
    conversations: Arc<dyn ConversationStore>,
    store_forward: StoreForward,
    shutdown: Arc<Notify>,
    running: RwLock<bool>,
}

impl MeshService {
    /// Build the service around an identity and a persistence backend.
    /// Identity is fixed here for the life of the service.
    pub fn new(
        config: MeshConfig,
        local_mesh_id: impl Into<String>,
        local_display_name: impl Into<String>,
        messages: Arc<dyn MessageStore>,
        peers: Arc<dyn PeerStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Arc<Self> {
        let seen = Arc::new(SeenPacketCache::with_limits(
            config.seen_cache_capacity,
            Duration::from_secs(config.seen_cache_max_age_secs),
        ));
        let bus = Arc::new(StatusBus::new());
        let dispatcher = Arc::new(TransportDispatcher::with_announce_interval(
            Duration::from_secs(config.announce_interval_secs),
        ));
        let replay_window = chrono::Duration::hours(config.replay_window_hours);
        let router = Arc::new(MeshRouter::new(
            local_mesh_id,
            local_display_name,
            config.max_hops,
            Arc::clone(&seen),
            Arc::clone(&messages),
            Arc::clone(&peers),
            Arc::clone(&conversations),
            Arc::clone(&bus),
            StoreForward::new(Arc::clone(&messages), Arc::clone(&peers), replay_window),
        ));
        let store_forward =
            StoreForward::new(Arc::clone(&messages), Arc::clone(&peers), replay_window);

        Arc::new(Self {
            config,
            router,
            dispatcher,
            seen,
            bus,
            messages,
            peers,
            conversations,
            store_forward,
            shutdown: Arc::new(Notify::new()),
            running: RwLock::new(false),
        })
    }

    /// Add a transport before `start`.
    pub async fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.dispatcher.register(transport).await;
    }

    /// Wire router and dispatcher together, start every transport, and
    /// launch the background sweepers.
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("mesh service already running");
                return Ok(());
            }
            *running = true;
        }

        let router = Arc::clone(&self.router);
        self.dispatcher
            .set_handler(Arc::new(move |event| {
                let router = Arc::clone(&router);
                Box::pin(async move { router.handle_transport_event(event).await })
            }))
            .await;

        let router = Arc::clone(&self.router);
        self.dispatcher
            .set_announcer(Arc::new(move || {
                let router = Arc::clone(&router);
                Box::pin(async move { router.broadcast_peer_announcement(None, None).await })
            }))
            .await;

        let dispatcher = Arc::clone(&self.dispatcher);
        self.router
            .set_outbound(Arc::new(move |packet, endpoint, kind| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move {
                    dispatcher.send(&packet, endpoint.as_deref(), kind).await;
                })
            }))
            .await;

        self.dispatcher.start_all().await?;
        self.spawn_sweepers();
        self.router.broadcast_peer_announcement(None, None).await;

        info!("mesh service started as {}", self.router.local_mesh_id());
        Ok(())
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        let seen = Arc::clone(&self.seen);
        let shutdown = Arc::clone(&self.shutdown);
        let seen_interval = Duration::from_secs(self.config.seen_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(seen_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => seen.sweep(),
                    _ = shutdown.notified() => break,
                }
            }
            debug!("seen-cache sweeper terminated");
        });

        let service = Arc::clone(self);
        let retention_interval = Duration::from_secs(self.config.retention_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(retention_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let retention = chrono::Duration::days(service.config.retention_days);
                        service.store_forward.sweep_retention(retention).await;
                    }
                    _ = service.shutdown.notified() => break,
                }
            }
            debug!("retention sweeper terminated");
        });

        let service = Arc::clone(self);
        let stale_interval = Duration::from_secs(self.config.stale_peer_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(stale_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let threshold = Utc::now()
                            - chrono::Duration::seconds(service.config.stale_peer_timeout_secs);
                        match service.peers.mark_lost(threshold).await {
                            Ok(0) => {}
                            Ok(lost) => info!("marked {} peer(s) lost", lost),
                            Err(e) => debug!("stale peer sweep failed: {}", e),
                        }
                    }
                    _ = service.shutdown.notified() => break,
                }
            }
            debug!("stale-peer sweeper terminated");
        });
    }

    /// Stop transports and sweepers; peers are marked disconnected.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.router.announce_leave().await;
        self.dispatcher.stop_all().await;
        self.shutdown.notify_waiters();
        match self.peers.disconnect_all().await {
            Ok(n) if n > 0 => debug!("disconnected {} peer(s)", n),
            Ok(_) => {}
            Err(e) => warn!("disconnect_all failed: {}", e),
        }
        info!("mesh service stopped");
    }

    // ------------------------------------------------------------------
    // Application-facing API, delegated to the router and stores
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        destination_id: &str,
        content: &str,
        content_kind: ContentKind,
        media_info: Option<MediaInfo>,
    ) -> MeshResult<MeshMessage> {
        self.router
            .send_message(destination_id, content, content_kind, media_info)
            .await
    }

    pub async fn send_sos(&self, message: &str) -> MeshResult<MeshMessage> {
        self.router.send_sos(message).await
    }

    pub async fn broadcast_peer_announcement(&self, latitude: Option<f64>, longitude: Option<f64>) {
        self.router
            .broadcast_peer_announcement(latitude, longitude)
            .await;
    }

    /// Stream of newly delivered inbound messages.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<MeshMessage> {
        self.bus.subscribe_incoming()
    }

    /// Stream of status updates.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.bus.subscribe_events()
    }

    /// Latest-value cell of aggregate link status.
    pub fn subscribe_link_status(&self) -> watch::Receiver<LinkStatus> {
        self.dispatcher.subscribe_status()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.dispatcher.status()
    }

    /// Flag a whole conversation read and reset its unread counter.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> MeshResult<()> {
        self.messages.mark_all_read(conversation_id).await?;
        self.conversations.clear_unread(conversation_id).await?;
        Ok(())
    }

    pub async fn conversation(&self, id: &str) -> MeshResult<Option<Conversation>> {
        Ok(self.conversations.get_by_id(id).await?)
    }

    pub async fn messages_for(&self, conversation_id: &str) -> MeshResult<Vec<MeshMessage>> {
        Ok(self.messages.for_conversation(conversation_id).await?)
    }

    pub async fn connected_peers(&self) -> MeshResult<Vec<Peer>> {
        Ok(self.peers.get_connected().await?)
    }

    pub fn local_mesh_id(&self) -> &str {
        self.router.local_mesh_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryConversationStore, MemoryMessageStore, MemoryPeerStore};

    fn service() -> Arc<MeshService> {
        MeshService::new(
            MeshConfig::default(),
            "local-node",
            "Local",
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryPeerStore::new()),
            Arc::new(MemoryConversationStore::new()),
        )
    }

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let service = service();
        service.start().await.unwrap();
        service.start().await.unwrap();
        service.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_send_message_without_transports_still_persists() {
        let service = service();
        service.start().await.unwrap();

        let message = service
            .send_message("far-away", "hello", ContentKind::Text, None)
            .await
            .unwrap();
        assert_eq!(message.status, storage::MessageStatus::Sent);

        let stored = service.messages_for("far-away").await.unwrap();
        assert_eq!(stored.len(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_mark_conversation_read_clears_unread() {
        let service = service();
        service.start().await.unwrap();
        service
            .send_message("peer-x", "hi", ContentKind::Text, None)
            .await
            .unwrap();

        service.mark_conversation_read("peer-x").await.unwrap();
        let conversation = service.conversation("peer-x").await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 0);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_sos_is_a_broadcast_send() {
        let service = service();
        service.start().await.unwrap();
        let message = service.send_sos("emergency").await.unwrap();
        assert_eq!(message.destination_id, protocol::SOS_BROADCAST_DEST);
        assert_eq!(message.content_kind, ContentKind::Sos);
        assert_eq!(message.conversation_id, storage::BROADCAST_CONVERSATION_ID);
        service.stop().await;
    }
}
