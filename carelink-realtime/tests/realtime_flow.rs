//! End-to-end flows through `RealtimeClient` over the in-process transport.

use async_trait::async_trait;
use carelink_core::config::RealtimeConfig;
use carelink_core::models::{ConversationId, MessageId, UserId};
use carelink_realtime::channel::ChannelBindings;
use carelink_realtime::transport::{OpenedChannel, TransportEvent};
use carelink_realtime::{
    ChangeDelivery, ChangeKind, ChannelKey, ChannelRegistry, ConnectionState, Error,
    ManualClock, MemoryReceiptStore, MemoryTransport, PresenceSpec, RealtimeClient,
    SubscriptionConfig, TableWatch, Transport, WatchEvent,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

fn client_on(transport: &MemoryTransport, user: &str, clock: &ManualClock) -> RealtimeClient {
    RealtimeClient::with_clock(
        UserId::from(user),
        Arc::new(transport.clone()),
        Arc::new(MemoryReceiptStore::new()),
        &RealtimeConfig::default(),
        Arc::new(clock.clone()),
    )
}

#[tokio::test(start_paused = true)]
async fn test_message_burst_delivered_as_one_batch() {
    let transport = MemoryTransport::new(UserId::from("nurse-1"));
    let client = client_on(&transport, "nurse-1", &ManualClock::default());
    client.start().unwrap();
    settle().await;

    let deliveries: Arc<Mutex<Vec<ChangeDelivery>>> = Arc::default();
    let sink = deliveries.clone();
    let conversation = ConversationId::from("42");
    let config = SubscriptionConfig::new().watch_table(
        TableWatch::new("messages", WatchEvent::Insert, move |d| sink.lock().push(d))
            .filter("conversation_id=eq.42")
            .debounce(Duration::ZERO),
    );
    client
        .subscribe(ChannelKey::conversation(&conversation), config)
        .await
        .unwrap();

    // Three inserts a couple of milliseconds apart, as a sender's burst arrives
    for id in ["m1", "m2", "m3"] {
        transport.emit_change("messages", ChangeKind::Insert, json!({ "id": id, "conversation_id": "42" }));
        advance(2).await;
    }
    // Different conversation, filtered out
    transport.emit_change("messages", ChangeKind::Insert, json!({ "id": "x", "conversation_id": "7" }));
    advance(50).await;

    let deliveries = deliveries.lock();
    assert_eq!(deliveries.len(), 1);
    let ids: Vec<_> = deliveries[0]
        .events()
        .iter()
        .map(|e| e.row["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_subscriptions_before_start_open_on_connect() {
    let transport = MemoryTransport::new(UserId::from("nurse-1"));
    let client = client_on(&transport, "nurse-1", &ManualClock::default());

    let hits = Arc::new(Mutex::new(0usize));
    let sink = hits.clone();
    let config = SubscriptionConfig::new().on_broadcast("alert", move |_| *sink.lock() += 1);
    let key = ChannelKey::from("patient-monitoring-clinic-a");
    client.subscribe(key.clone(), config).await.unwrap();
    assert_eq!(transport.active_channel_count(), 0);

    client.start().unwrap();
    settle().await;
    assert_eq!(client.connection_status().state, ConnectionState::Connected);
    assert_eq!(transport.emit_broadcast(&key, "alert", json!({ "bed": 4 })), 1);
    settle().await;
    assert_eq!(*hits.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_subscriptions() {
    let transport = MemoryTransport::new(UserId::from("nurse-1"));
    let client = client_on(&transport, "nurse-1", &ManualClock::default());
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _listener = client.on_connection_change(move |s| sink.lock().push(s.state));

    let deliveries = Arc::new(Mutex::new(0usize));
    let sink = deliveries.clone();
    let config = SubscriptionConfig::new().watch_table(
        TableWatch::new("vitals", WatchEvent::All, move |d| *sink.lock() += d.len())
            .debounce(Duration::ZERO),
    );
    client
        .subscribe(ChannelKey::from("patient-monitoring-t1"), config)
        .await
        .unwrap();
    client.start().unwrap();
    settle().await;

    transport.fail_next_connects(1);
    transport.close("socket reset");
    settle().await;
    assert_eq!(client.connection_status().state, ConnectionState::Reconnecting);

    advance(1000).await;
    assert_eq!(client.connection_status().reconnect_attempts, 1);
    advance(2000).await;

    let status = client.connection_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(states.lock().last(), Some(&ConnectionState::Connected));
    assert!(states.lock().contains(&ConnectionState::Reconnecting));

    transport.emit_change("vitals", ChangeKind::Update, json!({ "hr": 88 }));
    advance(50).await;
    assert_eq!(*deliveries.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_is_reported() {
    let transport = MemoryTransport::new(UserId::from("nurse-1"));
    let client = client_on(&transport, "nurse-1", &ManualClock::default());
    let exhausted = Arc::new(Mutex::new(false));
    let sink = exhausted.clone();
    let _listener = client.on_connection_change(move |s| {
        if s.retries_exhausted {
            *sink.lock() = true;
        }
    });

    client.start().unwrap();
    settle().await;
    transport.fail_next_connects(u32::MAX);
    transport.close("backend down");
    settle().await;

    for delay in [1000, 2000, 4000, 8000, 16000] {
        advance(delay).await;
    }
    assert!(*exhausted.lock());
    assert_eq!(client.connection_status().state, ConnectionState::Reconnecting);

    // Network flapping restores the retry budget
    transport.fail_next_connects(0);
    client.set_network_online(false).await.unwrap();
    settle().await;
    assert_eq!(client.connection_status().state, ConnectionState::Offline);
    client.set_network_online(true).await.unwrap();
    settle().await;
    assert_eq!(client.connection_status().state, ConnectionState::Connected);
}

/// Memory transport that refuses to open selected channels
struct FlakyTransport {
    inner: MemoryTransport,
    refuse: Mutex<HashSet<ChannelKey>>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn connect(&self) -> carelink_realtime::Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events()
    }

    async fn open_channel(
        &self,
        key: &ChannelKey,
        bindings: ChannelBindings,
    ) -> carelink_realtime::Result<OpenedChannel> {
        if self.refuse.lock().contains(key) {
            return Err(Error::TransportOpenFailure(format!("refused {key}")));
        }
        self.inner.open_channel(key, bindings).await
    }

    fn active_channel_count(&self) -> usize {
        self.inner.active_channel_count()
    }
}

#[tokio::test]
async fn test_recreate_continues_past_failures() {
    let inner = MemoryTransport::new(UserId::from("nurse-1"));
    let flaky = Arc::new(FlakyTransport {
        inner: inner.clone(),
        refuse: Mutex::new(HashSet::new()),
    });
    let registry = ChannelRegistry::new(flaky.clone(), Duration::from_millis(100));

    let keys: Vec<ChannelKey> = ["conversation-1", "conversation-2", "conversation-3"]
        .into_iter()
        .map(ChannelKey::from)
        .collect();
    for key in &keys {
        registry.subscribe(key.clone(), SubscriptionConfig::new()).await.unwrap();
    }

    flaky.refuse.lock().insert(keys[1].clone());
    flaky.connect().await.unwrap();
    let report = registry.recreate_all().await;
    assert_eq!(report.recreated, vec![keys[0].clone(), keys[2].clone()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, keys[1]);
    assert!(matches!(report.failed[0].1, Error::TransportOpenFailure(_)));

    // The failed blueprint is kept for the next attempt
    assert_eq!(registry.keys().await, keys);
    registry.suspend_all().await;
    flaky.refuse.lock().clear();
    let report = registry.recreate_all().await;
    assert!(report.is_complete());
    assert_eq!(inner.active_channel_count(), 3);
}

#[tokio::test]
async fn test_unsubscribe_during_recreation_wins() {
    let transport = MemoryTransport::new(UserId::from("nurse-1"));
    let registry = Arc::new(ChannelRegistry::new(
        Arc::new(transport.clone()),
        Duration::from_millis(100),
    ));
    let key = ChannelKey::from("conversation-1");
    registry.subscribe(key.clone(), SubscriptionConfig::new()).await.unwrap();
    transport.connect().await.unwrap();

    let recreating = tokio::spawn({
        let registry = registry.clone();
        async move { registry.recreate_all().await }
    });
    registry.unsubscribe(&key).await;
    recreating.await.unwrap();

    assert!(!registry.is_subscribed(&key).await);
    assert_eq!(transport.active_channel_count(), 0);
}

#[tokio::test]
async fn test_typing_between_participants() {
    let clock = ManualClock::default();
    let nurse_transport = MemoryTransport::new(UserId::from("nurse-1"));
    let doctor_transport = nurse_transport.peer(UserId::from("doctor-1"));
    let nurse = client_on(&nurse_transport, "nurse-1", &clock);
    let doctor = client_on(&doctor_transport, "doctor-1", &clock);

    let conversation = ConversationId::from("42");
    for client in [&nurse, &doctor] {
        client.start().unwrap();
        client
            .subscribe(ChannelKey::conversation(&conversation), SubscriptionConfig::new())
            .await
            .unwrap();
    }
    settle().await;

    nurse.set_typing(&conversation, true).await.unwrap();
    settle().await;
    let nurse_id = UserId::from("nurse-1");
    assert!(doctor.is_typing(&conversation, &nurse_id));
    assert_eq!(doctor.typing_users(&conversation), vec![nurse_id.clone()]);

    // The nurse's process vanishes without clearing
    clock.advance(chrono::Duration::seconds(11));
    assert!(!doctor.is_typing(&conversation, &nurse_id));
}

#[tokio::test]
async fn test_online_users_across_sessions() {
    let nurse_transport = MemoryTransport::new(UserId::from("nurse-1"));
    let clock = ManualClock::default();
    let nurse = client_on(&nurse_transport, "nurse-1", &clock);
    let nurse_tablet = client_on(&nurse_transport.peer(UserId::from("nurse-1")), "nurse-1", &clock);
    let doctor = client_on(&nurse_transport.peer(UserId::from("doctor-1")), "doctor-1", &clock);

    let key = ChannelKey::from("conversation-42");
    for client in [&nurse, &nurse_tablet, &doctor] {
        client.start().unwrap();
        settle().await;
        client
            .subscribe(
                key.clone(),
                SubscriptionConfig::new().with_presence(PresenceSpec::new(json!({ "status": "available" }))),
            )
            .await
            .unwrap();
    }
    settle().await;

    let online: Vec<String> = nurse
        .get_online_users(&key)
        .into_iter()
        .map(|e| e.user_id.to_string())
        .collect();
    assert_eq!(online, vec!["doctor-1", "nurse-1"]);

    doctor.unsubscribe(&key).await;
    settle().await;
    assert_eq!(nurse.get_online_users(&key).len(), 1);
}

#[tokio::test]
async fn test_read_receipts_through_client() {
    let store = Arc::new(MemoryReceiptStore::new());
    let conversation = ConversationId::from("42");
    store.add_message(MessageId::from("m1"), conversation.clone(), UserId::from("doctor-1"));
    store.add_message(MessageId::from("m2"), conversation.clone(), UserId::from("doctor-1"));

    let client = RealtimeClient::new(
        UserId::from("nurse-1"),
        Arc::new(MemoryTransport::new(UserId::from("nurse-1"))),
        store.clone(),
        &RealtimeConfig::default(),
    );

    assert_eq!(client.mark_read(&MessageId::from("m1")).await, 1);
    assert_eq!(client.mark_read(&MessageId::from("m1")).await, 0);
    assert_eq!(client.mark_conversation_read(&conversation).await, 1);
    assert_eq!(client.mark_conversation_read(&conversation).await, 0);
    assert_eq!(store.receipt_count(), 2);
}
