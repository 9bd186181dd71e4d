use carelink_core::config::RealtimeConfig;
use carelink_core::models::{ConversationId, MessageId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::channel::{ChannelKey, SubscriptionConfig};
use crate::clock::{Clock, SystemClock};
use crate::connection::{
    ConnectionStatus, ConnectionSupervisor, ListenerHandle, SupervisorConfig,
};
use crate::error::Result;
use crate::events::PresenceEntry;
use crate::receipts::{ReadReceiptCoordinator, ReceiptStore};
use crate::registry::{ChannelRegistry, SubscriptionHandle};
use crate::transport::Transport;
use crate::typing::TypingIndicatorService;

/// Everything the application needs from the realtime layer, wired together
pub struct RealtimeClient {
    user_id: UserId,
    registry: Arc<ChannelRegistry>,
    supervisor: ConnectionSupervisor,
    typing: Arc<TypingIndicatorService>,
    receipts: ReadReceiptCoordinator,
}

impl RealtimeClient {
    pub fn new(
        user_id: UserId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ReceiptStore>,
        config: &RealtimeConfig,
    ) -> Self {
        Self::with_clock(user_id, transport, store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        user_id: UserId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ReceiptStore>,
        config: &RealtimeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new(
            transport.clone(),
            Duration::from_millis(config.default_debounce_ms),
        ));
        let typing = TypingIndicatorService::new(
            user_id.clone(),
            registry.clone(),
            clock.clone(),
            Duration::from_secs(config.typing_timeout_secs),
        );
        let supervisor =
            ConnectionSupervisor::new(transport, registry.clone(), SupervisorConfig::from(config));
        let receipts = ReadReceiptCoordinator::new(user_id.clone(), store, clock);

        Self {
            user_id,
            registry,
            supervisor,
            typing,
            receipts,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Begin connecting; subscriptions made before this are opened once connected
    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    pub async fn shutdown(&self) {
        self.typing.shutdown();
        self.supervisor.shutdown().await;
        info!(user = %self.user_id, "Realtime client shut down");
    }

    pub async fn subscribe(
        &self,
        key: ChannelKey,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        self.registry.subscribe(key, config).await
    }

    pub async fn unsubscribe(&self, key: &ChannelKey) {
        self.registry.unsubscribe(key).await;
    }

    pub async fn broadcast(
        &self,
        key: &ChannelKey,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.registry.broadcast(key, event, payload).await
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.supervisor.watch()
    }

    pub fn on_connection_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.supervisor.on_connection_change(listener)
    }

    pub async fn force_reconnect(&self) -> Result<()> {
        self.supervisor.force_reconnect().await
    }

    pub async fn set_network_online(&self, online: bool) -> Result<()> {
        self.supervisor.set_network_online(online).await
    }

    pub async fn set_typing(&self, conversation: &ConversationId, is_typing: bool) -> Result<()> {
        self.typing.set_typing(conversation, is_typing).await
    }

    #[must_use]
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing.is_typing(conversation, user)
    }

    #[must_use]
    pub fn typing_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.typing.typing_users(conversation)
    }

    pub async fn mark_read(&self, message_id: &MessageId) -> u64 {
        self.receipts.mark_read(message_id).await
    }

    pub async fn mark_conversation_read(&self, conversation: &ConversationId) -> u64 {
        self.receipts.mark_conversation_read(conversation).await
    }

    /// One entry per user on a presence-tracking channel, sorted by user id
    #[must_use]
    pub fn get_online_users(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        self.registry.online_users(key)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}
