//! Logical subscriptions and their live channels.
//!
//! The registry owns the blueprint ([`SubscriptionConfig`]) of every logical
//! subscription, keyed by [`ChannelKey`] in registration order, and the live
//! channel currently realising it, if any. Blueprints survive connection loss;
//! live channels do not and are rebuilt from the blueprints by
//! [`ChannelRegistry::recreate_all`].
//!
//! Every mutation goes through one async lock so subscribe, unsubscribe and
//! recreation of the same key never interleave.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{BatchKey, ChangeBatcher};
use crate::channel::{ChannelBindings, ChannelKey, SubscriptionConfig};
use crate::error::{Error, Result};
use crate::events::{BroadcastMessage, ChangeEvent, InboundEvent, PresenceEntry, PresenceEvent};
use crate::presence::PresenceTracker;
use crate::transport::{OpenedChannel, Transport, TransportChannel};

/// Hook for services that piggyback on channels they do not own
pub trait ChannelObserver: Send + Sync {
    /// Extra broadcast events to bind when `key` is opened
    fn broadcast_events(&self, _key: &ChannelKey) -> Vec<String> {
        Vec::new()
    }

    fn on_broadcast(&self, _key: &ChannelKey, _message: &BroadcastMessage) {}

    /// `key` was unsubscribed and its blueprint discarded
    fn on_channel_removed(&self, _key: &ChannelKey) {}
}

/// Returned by [`ChannelRegistry::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    key: ChannelKey,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }
}

/// Outcome of rebuilding live channels after a reconnect
#[derive(Debug, Default)]
pub struct RecreateReport {
    pub recreated: Vec<ChannelKey>,
    pub failed: Vec<(ChannelKey, Error)>,
}

impl RecreateReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ActiveChannel {
    channel: Arc<dyn TransportChannel>,
    /// Stops this incarnation's dispatcher
    incarnation: CancellationToken,
}

struct Entry {
    config: Arc<SubscriptionConfig>,
    /// Lives until unsubscribe; parent of every timer the subscription arms
    lifetime: CancellationToken,
    active: Option<ActiveChannel>,
}

#[derive(Default)]
struct RegistryState {
    entries: IndexMap<ChannelKey, Entry>,
    connected: bool,
}

pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
    batcher: Arc<ChangeBatcher>,
    presence: Arc<PresenceTracker>,
    observers: RwLock<Vec<Weak<dyn ChannelObserver>>>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn Transport>, default_debounce: Duration) -> Self {
        Self {
            transport,
            state: Mutex::new(RegistryState::default()),
            batcher: Arc::new(ChangeBatcher::new(default_debounce)),
            presence: Arc::new(PresenceTracker::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Weak<dyn ChannelObserver>) {
        self.observers.write().push(observer);
    }

    fn live_observers(&self) -> Vec<Arc<dyn ChannelObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Register a logical subscription and, if connected, open its channel.
    ///
    /// Before the first connection the blueprint is only stored; the
    /// supervisor opens it once connected. If opening fails the blueprint is
    /// not kept. A config with an unparseable row filter is rejected.
    pub async fn subscribe(
        &self,
        key: ChannelKey,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        config.validate()?;
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&key) {
            return Err(Error::DuplicateChannel(key));
        }

        let config = Arc::new(config);
        let lifetime = CancellationToken::new();
        let active = if state.connected {
            Some(self.open(&key, &config, &lifetime).await?)
        } else {
            debug!(channel = %key, "Not connected, deferring channel open");
            None
        };

        info!(channel = %key, live = active.is_some(), "Subscribed");
        state.entries.insert(
            key.clone(),
            Entry {
                config,
                lifetime,
                active,
            },
        );
        Ok(SubscriptionHandle { key })
    }

    /// Tear down the live channel, leave presence, cancel every pending
    /// timer of the subscription and discard its blueprint. Unknown keys are
    /// a no-op.
    pub async fn unsubscribe(&self, key: &ChannelKey) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.shift_remove(key) else {
            debug!(channel = %key, "Unsubscribe for unknown channel");
            return;
        };

        entry.lifetime.cancel();
        if let Some(active) = entry.active {
            Self::teardown(key, active).await;
        }
        self.batcher.cancel_channel(key);
        self.presence.stop_tracking(key);
        drop(state);

        for observer in self.live_observers() {
            observer.on_channel_removed(key);
        }
        info!(channel = %key, "Unsubscribed");
    }

    /// Send a broadcast on a subscribed channel
    pub async fn broadcast(
        &self,
        key: &ChannelKey,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let channel = {
            let state = self.state.lock().await;
            let entry = state
                .entries
                .get(key)
                .ok_or_else(|| Error::ChannelNotFound(key.clone()))?;
            entry.active.as_ref().map(|a| a.channel.clone())
        };
        match channel {
            Some(channel) => channel.send(event, payload).await,
            None => Err(Error::WriteFailure(format!("channel {key} is not live"))),
        }
    }

    /// Rebuild every live channel from its blueprint, in registration order.
    ///
    /// Marks the registry connected so later subscriptions open immediately.
    /// A failure on one key does not stop the others.
    pub async fn recreate_all(&self) -> RecreateReport {
        let keys: Vec<ChannelKey> = {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.entries.keys().cloned().collect()
        };

        let mut report = RecreateReport::default();
        for key in keys {
            let mut state = self.state.lock().await;
            let Some(entry) = state.entries.get(&key) else {
                // Unsubscribed while we were working through the list
                continue;
            };
            if entry.active.is_some() {
                continue;
            }
            let (config, lifetime) = (entry.config.clone(), entry.lifetime.clone());

            match self.open(&key, &config, &lifetime).await {
                Ok(active) => {
                    if let Some(entry) = state.entries.get_mut(&key) {
                        entry.active = Some(active);
                    }
                    report.recreated.push(key);
                }
                Err(e) => {
                    warn!(channel = %key, error = %e, "Failed to recreate channel");
                    report.failed.push((key, e));
                }
            }
        }

        info!(
            recreated = report.recreated.len(),
            failed = report.failed.len(),
            "Recreated channels"
        );
        report
    }

    /// Drop every live channel but keep the blueprints; used when the
    /// connection is lost or about to be replaced.
    pub async fn suspend_all(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        let mut suspended = 0usize;
        for (key, entry) in &mut state.entries {
            if let Some(active) = entry.active.take() {
                Self::teardown(key, active).await;
                suspended += 1;
            }
        }
        if suspended > 0 {
            info!(channels = suspended, "Suspended live channels");
        }
    }

    /// Number of logical subscriptions, live or not
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Number of subscriptions with a live channel
    pub async fn live_count(&self) -> usize {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.active.is_some())
            .count()
    }

    /// Subscribed keys in registration order
    pub async fn keys(&self) -> Vec<ChannelKey> {
        self.state.lock().await.entries.keys().cloned().collect()
    }

    pub async fn is_subscribed(&self, key: &ChannelKey) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    /// One entry per online user of a presence-tracking channel
    #[must_use]
    pub fn online_users(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        self.presence.online_users(key)
    }

    /// Every presence session on a channel
    #[must_use]
    pub fn presence_sessions(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        self.presence.snapshot(key)
    }

    fn bindings_for(&self, key: &ChannelKey, config: &SubscriptionConfig) -> ChannelBindings {
        let mut bindings = config.bindings();
        for observer in self.live_observers() {
            for event in observer.broadcast_events(key) {
                if !bindings.wants_broadcast(&event) {
                    bindings.broadcast_events.push(event);
                }
            }
        }
        bindings
    }

    async fn open(
        &self,
        key: &ChannelKey,
        config: &Arc<SubscriptionConfig>,
        lifetime: &CancellationToken,
    ) -> Result<ActiveChannel> {
        let bindings = self.bindings_for(key, config);
        let OpenedChannel { channel, events } = self.transport.open_channel(key, bindings).await?;

        if config.tracks_presence() {
            self.presence.start_tracking(key);
        }

        let incarnation = lifetime.child_token();
        let dispatcher = Dispatcher {
            key: key.clone(),
            config: config.clone(),
            batcher: self.batcher.clone(),
            presence: self.presence.clone(),
            observers: self.live_observers(),
            lifetime: lifetime.clone(),
        };
        tokio::spawn(dispatcher.run(events, incarnation.clone()));

        if let Some(presence) = &config.presence {
            if let Err(e) = channel.track(presence.initial_state.clone()).await {
                warn!(channel = %key, error = %e, "Presence track failed");
                incarnation.cancel();
                channel.close().await;
                self.presence.stop_tracking(key);
                return Err(e);
            }
        }

        debug!(channel = %key, "Channel open");
        Ok(ActiveChannel {
            channel,
            incarnation,
        })
    }

    async fn teardown(key: &ChannelKey, active: ActiveChannel) {
        active.incarnation.cancel();
        active.channel.close().await;
        debug!(channel = %key, "Channel closed");
    }
}

/// Routes one live channel's inbound events to its blueprint's callbacks
struct Dispatcher {
    key: ChannelKey,
    config: Arc<SubscriptionConfig>,
    batcher: Arc<ChangeBatcher>,
    presence: Arc<PresenceTracker>,
    observers: Vec<Arc<dyn ChannelObserver>>,
    lifetime: CancellationToken,
}

impl Dispatcher {
    async fn run(self, mut events: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!(channel = %self.key, "Transport dropped the channel");
                break;
            };
            self.handle(event);
        }
    }

    fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Change(change) => self.on_change(&change),
            InboundEvent::Broadcast(message) => self.on_broadcast(&message),
            InboundEvent::Presence(presence) => self.on_presence(&presence),
        }
    }

    fn on_change(&self, change: &ChangeEvent) {
        for (index, watch) in self.config.tables.iter().enumerate() {
            if !watch.accepts(change) {
                continue;
            }
            let key = BatchKey {
                channel_key: self.key.clone(),
                table: watch.table.clone(),
                event: change.event_type,
                watch: index,
            };
            self.batcher.push(
                key,
                change.clone(),
                watch.debounce,
                &watch.callback,
                &self.lifetime,
            );
        }
    }

    fn on_broadcast(&self, message: &BroadcastMessage) {
        for observer in &self.observers {
            observer.on_broadcast(&self.key, message);
        }
        for watch in self.config.broadcasts.iter().filter(|w| w.event == message.event) {
            (watch.callback)(message.clone());
        }
    }

    fn on_presence(&self, event: &PresenceEvent) {
        let Some(spec) = &self.config.presence else {
            return;
        };
        if !self.presence.apply(&self.key, event) {
            return;
        }
        match event {
            PresenceEvent::Sync(_) => {
                if let Some(on_sync) = &spec.on_sync {
                    on_sync(self.presence.snapshot(&self.key));
                }
            }
            PresenceEvent::Join(joined) => {
                if let Some(on_join) = &spec.on_join {
                    on_join(joined.clone());
                }
            }
            PresenceEvent::Leave(left) => {
                if let Some(on_leave) = &spec.on_leave {
                    on_leave(left.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{PresenceSpec, TableWatch};
    use crate::events::{ChangeDelivery, ChangeKind, WatchEvent};
    use crate::transport::MemoryTransport;
    use carelink_core::models::UserId;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn setup() -> (MemoryTransport, Arc<ChannelRegistry>) {
        let transport = MemoryTransport::new(UserId::from("nurse-1"));
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(transport.clone()),
            Duration::from_millis(100),
        ));
        (transport, registry)
    }

    async fn connected() -> (MemoryTransport, Arc<ChannelRegistry>) {
        let (transport, registry) = setup();
        transport.connect().await.unwrap();
        registry.recreate_all().await;
        (transport, registry)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    /// Let every batch window close
    async fn flush_windows() {
        settle().await;
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_rejected() {
        let (_transport, registry) = connected().await;
        let key = ChannelKey::from("conversation-1");

        registry.subscribe(key.clone(), SubscriptionConfig::new()).await.unwrap();
        let err = registry
            .subscribe(key.clone(), SubscriptionConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateChannel(k) if k == key));
        assert_eq!(registry.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_deferred() {
        let (transport, registry) = setup();
        let key = ChannelKey::from("conversation-1");

        registry.subscribe(key.clone(), SubscriptionConfig::new()).await.unwrap();
        assert_eq!(registry.live_count().await, 0);
        assert_eq!(transport.active_channel_count(), 0);

        transport.connect().await.unwrap();
        let report = registry.recreate_all().await;
        assert!(report.is_complete());
        assert_eq!(report.recreated, vec![key]);
        assert_eq!(transport.active_channel_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_everything() {
        let (transport, registry) = connected().await;
        let key = ChannelKey::from("conversation-1");
        let config = SubscriptionConfig::new()
            .with_presence(PresenceSpec::new(json!({ "role": "nurse" })));

        registry.subscribe(key.clone(), config).await.unwrap();
        assert_eq!(transport.active_channel_count(), 1);

        registry.unsubscribe(&key).await;
        assert_eq!(registry.subscription_count().await, 0);
        assert_eq!(transport.active_channel_count(), 0);
        assert!(registry.online_users(&key).is_empty());

        // Unknown keys are a no-op
        registry.unsubscribe(&key).await;
    }

    #[tokio::test]
    async fn test_broadcast_unknown_key() {
        let (_transport, registry) = connected().await;
        let err = registry
            .broadcast(&ChannelKey::from("nope"), "typing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_broadcast_on_suspended_channel_fails() {
        let (_transport, registry) = connected().await;
        let key = ChannelKey::from("conversation-1");
        registry.subscribe(key.clone(), SubscriptionConfig::new()).await.unwrap();

        registry.suspend_all().await;
        let err = registry.broadcast(&key, "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::WriteFailure(_)));
        assert_eq!(registry.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_unsupported_filter_rejected() {
        let (transport, registry) = connected().await;
        let key = ChannelKey::from("conversation-42");
        let config = SubscriptionConfig::new().watch_table(
            TableWatch::new("messages", WatchEvent::Insert, |_| {}).filter("conversation_id=in.(42)"),
        );

        let err = registry.subscribe(key.clone(), config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }));
        assert!(!registry.is_subscribed(&key).await);
        assert_eq!(transport.active_channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_preserves_order_and_callbacks() {
        let (transport, registry) = connected().await;
        let seen = Arc::new(SyncMutex::new(Vec::new()));

        for id in ["conversation-b", "conversation-a", "conversation-c"] {
            let sink = seen.clone();
            let config = SubscriptionConfig::new().watch_table(
                TableWatch::new("messages", WatchEvent::Insert, move |d: ChangeDelivery| {
                    sink.lock().extend(d.into_events().into_iter().map(|e| e.channel_key));
                })
                .debounce(Duration::ZERO),
            );
            registry.subscribe(ChannelKey::from(id), config).await.unwrap();
        }

        registry.suspend_all().await;
        assert_eq!(transport.active_channel_count(), 0);

        let report = registry.recreate_all().await;
        let order: Vec<_> = report.recreated.iter().map(ChannelKey::as_str).collect();
        assert_eq!(order, vec!["conversation-b", "conversation-a", "conversation-c"]);

        transport.emit_change("messages", ChangeKind::Insert, json!({ "id": 1 }));
        flush_windows().await;
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_debounce_batches_a_burst() {
        let (transport, registry) = connected().await;
        let deliveries = Arc::new(SyncMutex::new(Vec::new()));
        let sink = deliveries.clone();
        let config = SubscriptionConfig::new().watch_table(
            TableWatch::new("vitals", WatchEvent::All, move |d| sink.lock().push(d))
                .debounce(Duration::ZERO),
        );
        registry
            .subscribe(ChannelKey::from("patient-monitoring-t1"), config)
            .await
            .unwrap();

        for n in 0..5 {
            transport.emit_change("vitals", ChangeKind::Update, json!({ "n": n }));
            settle().await;
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert!(deliveries.lock().is_empty());
        flush_windows().await;

        let deliveries = deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_star_watch_batches_per_change_kind() {
        let (transport, registry) = connected().await;
        let deliveries = Arc::new(SyncMutex::new(Vec::new()));
        let sink = deliveries.clone();
        let config = SubscriptionConfig::new().watch_table(TableWatch::new(
            "vitals",
            WatchEvent::All,
            move |d: ChangeDelivery| {
                sink.lock().push(d.events().iter().map(|e| e.event_type).collect::<Vec<_>>());
            },
        ));
        registry
            .subscribe(ChannelKey::from("patient-monitoring-t1"), config)
            .await
            .unwrap();

        transport.emit_change("vitals", ChangeKind::Insert, json!({ "id": 1 }));
        transport.emit_change("vitals", ChangeKind::Delete, json!({ "id": 1 }));
        transport.emit_change("vitals", ChangeKind::Insert, json!({ "id": 2 }));
        flush_windows().await;

        let mut deliveries = deliveries.lock().clone();
        deliveries.sort_by_key(|kinds| kinds.len());
        assert_eq!(
            deliveries,
            vec![
                vec![ChangeKind::Delete],
                vec![ChangeKind::Insert, ChangeKind::Insert],
            ]
        );
    }

    #[tokio::test]
    async fn test_presence_callbacks_and_online_users() {
        let (transport, registry) = connected().await;
        let key = ChannelKey::from("conversation-1");
        let syncs = Arc::new(SyncMutex::new(Vec::new()));
        let sink = syncs.clone();
        let config = SubscriptionConfig::new().with_presence(
            PresenceSpec::new(json!({ "role": "nurse" })).on_sync(move |s| sink.lock().push(s.len())),
        );
        registry.subscribe(key.clone(), config).await.unwrap();
        settle().await;

        let peer = transport.peer(UserId::from("doctor-1"));
        peer.connect().await.unwrap();
        let opened = peer
            .open_channel(&key, ChannelBindings { presence: true, ..Default::default() })
            .await
            .unwrap();
        opened.channel.track(json!({ "role": "doctor" })).await.unwrap();
        settle().await;

        let users: Vec<_> = registry
            .online_users(&key)
            .into_iter()
            .map(|e| e.user_id.to_string())
            .collect();
        assert_eq!(users, vec!["doctor-1", "nurse-1"]);
        assert_eq!(syncs.lock().last().copied(), Some(2));
    }
}
