use async_trait::async_trait;
use carelink_core::models::UserId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    forward, inbound_queue, OpenedChannel, Transport, TransportChannel, TransportEvent,
};
use crate::channel::{ChannelBindings, ChannelKey};
use crate::error::{Error, Result};
use crate::events::{
    BroadcastMessage, ChangeEvent, ChangeKind, InboundEvent, PresenceEntry, PresenceEvent,
};

const EVENT_CAPACITY: usize = 64;

/// A presence field not refreshed for this long belongs to a process that
/// went away without cleaning up
const PRESENCE_TTL: Duration = Duration::from_secs(90);
const PRESENCE_REFRESH: Duration = Duration::from_secs(30);

/// Row change as published on `{prefix}rt:changes:{table}` by the database side
#[derive(Debug, Serialize, Deserialize)]
struct RowChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    record: serde_json::Value,
    #[serde(default)]
    old_record: Option<serde_json::Value>,
}

/// Envelope for broadcasts; `session` lets a process skip its own messages
#[derive(Debug, Serialize, Deserialize)]
struct BroadcastEnvelope {
    session: String,
    event: String,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PresenceNotice {
    Join,
    Leave,
}

#[derive(Debug, Serialize, Deserialize)]
struct PresenceEnvelope {
    notice: PresenceNotice,
    entry: PresenceEntry,
}

/// Value stored under our field of `{prefix}presence:{key}`
#[derive(Debug, Serialize, Deserialize)]
struct StoredPresence {
    #[serde(flatten)]
    entry: PresenceEntry,
    seen_at: DateTime<Utc>,
}

/// Field name of this process's presence on `key`. Stable across reconnects
/// so re-tracking overwrites the previous field.
fn presence_ref(session: &str, key: &ChannelKey) -> String {
    format!("{session}-{key}")
}

/// Split a presence hash into live entries (sorted by ref) and the fields
/// whose last refresh is older than `ttl`
fn partition_presence(
    raw: &HashMap<String, String>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> (Vec<PresenceEntry>, Vec<String>) {
    let mut live = Vec::new();
    let mut expired = Vec::new();
    for (field, json) in raw {
        match serde_json::from_str::<StoredPresence>(json) {
            Ok(stored) => {
                let fresh = (now - stored.seen_at)
                    .to_std()
                    .map_or(true, |age| age <= ttl);
                if fresh {
                    live.push(stored.entry);
                } else {
                    expired.push(field.clone());
                }
            }
            Err(e) => {
                warn!(error = %e, field = %field, "Dropping malformed presence entry");
                expired.push(field.clone());
            }
        }
    }
    live.sort_by(|a, b| a.presence_ref.cmp(&b.presence_ref));
    (live, expired)
}

struct RedisSlot {
    id: u64,
    bindings: ChannelBindings,
    tx: mpsc::Sender<InboundEvent>,
    presence: Arc<Mutex<Vec<PresenceEntry>>>,
}

struct Shared {
    prefix: String,
    op_timeout: Duration,
    event_buffer: usize,
    conn: Mutex<Option<MultiplexedConnection>>,
    channels: DashMap<ChannelKey, RedisSlot>,
    /// Channels whose presence field outlived a lost connection; removed on
    /// the next successful connect
    orphaned: Mutex<Vec<ChannelKey>>,
    next_id: AtomicU64,
}

impl Shared {
    fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::WriteFailure("Redis transport not connected".to_string()))
    }

    fn pattern(&self) -> String {
        format!("{}rt:*", self.prefix)
    }

    fn broadcast_channel(&self, key: &ChannelKey) -> String {
        format!("{}rt:{}:broadcast", self.prefix, key)
    }

    fn presence_channel(&self, key: &ChannelKey) -> String {
        format!("{}rt:{}:presence", self.prefix, key)
    }

    fn presence_hash(&self, key: &ChannelKey) -> String {
        format!("{}presence:{}", self.prefix, key)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        timeout(self.op_timeout, conn.publish(channel, payload))
            .await
            .map_err(|_| Error::WriteFailure(format!("Timed out publishing to {channel}")))?
            .map_err(|e| Error::WriteFailure(format!("Failed to publish to {channel}: {e}")))
    }

    async fn presence_snapshot(&self, key: &ChannelKey) -> Result<Vec<PresenceEntry>> {
        let mut conn = self.connection()?;
        let hash = self.presence_hash(key);
        let raw: HashMap<String, String> = timeout(self.op_timeout, conn.hgetall(&hash))
            .await
            .map_err(|_| Error::WriteFailure(format!("Timed out reading {hash}")))?
            .map_err(|e| Error::WriteFailure(format!("Failed to read {hash}: {e}")))?;

        let (entries, expired) = partition_presence(&raw, Utc::now(), PRESENCE_TTL);
        if !expired.is_empty() {
            debug!(hash = %hash, fields = expired.len(), "Removing expired presence");
            match timeout(self.op_timeout, conn.hdel::<_, _, usize>(&hash, &expired)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, hash = %hash, "Expired presence cleanup failed"),
                Err(_) => debug!(hash = %hash, "Expired presence cleanup timed out"),
            }
        }
        Ok(entries)
    }

    /// Write our presence field with a fresh `seen_at`
    async fn write_presence(&self, key: &ChannelKey, entry: &PresenceEntry) -> Result<()> {
        let hash = self.presence_hash(key);
        let mut conn = self.connection()?;
        let json = serde_json::to_string(&StoredPresence {
            entry: entry.clone(),
            seen_at: Utc::now(),
        })?;
        timeout(
            self.op_timeout,
            conn.hset::<_, _, _, ()>(&hash, &entry.presence_ref, json),
        )
        .await
        .map_err(|_| Error::WriteFailure(format!("Timed out writing {hash}")))?
        .map_err(|e| Error::WriteFailure(format!("Failed to write {hash}: {e}")))
    }

    /// Route one pub/sub message to the local channels interested in it
    async fn dispatch(&self, session: &str, channel: &str, payload: &str) {
        let Some(rest) = channel.strip_prefix(&format!("{}rt:", self.prefix)) else {
            warn!(channel = %channel, "Message outside the realtime namespace");
            return;
        };

        if let Some(table) = rest.strip_prefix("changes:") {
            self.dispatch_change(table, payload);
            return;
        }

        let Some((key, kind)) = rest.rsplit_once(':') else {
            warn!(channel = %channel, "Invalid channel format");
            return;
        };
        let key = ChannelKey::from(key);

        match kind {
            "broadcast" => match serde_json::from_str::<BroadcastEnvelope>(payload) {
                Ok(envelope) if envelope.session == session => {}
                Ok(envelope) => {
                    if let Some(slot) = self.channels.get(&key) {
                        if slot.bindings.wants_broadcast(&envelope.event) {
                            let message = InboundEvent::Broadcast(BroadcastMessage {
                                event: envelope.event,
                                payload: envelope.payload,
                            });
                            forward(&slot.tx, &key, message);
                        }
                    }
                }
                Err(e) => warn!(error = %e, channel = %channel, "Failed to decode broadcast"),
            },
            "presence" => match serde_json::from_str::<PresenceEnvelope>(payload) {
                Ok(envelope) => self.dispatch_presence(&key, envelope).await,
                Err(e) => warn!(error = %e, channel = %channel, "Failed to decode presence notice"),
            },
            other => debug!(channel = %channel, kind = %other, "Ignoring unknown channel kind"),
        }
    }

    fn dispatch_change(&self, table: &str, payload: &str) {
        let change: RowChange = match serde_json::from_str(payload) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, table = %table, "Failed to decode row change");
                return;
            }
        };
        for slot in &self.channels {
            let event = ChangeEvent {
                table: table.to_string(),
                event_type: change.kind,
                row: change.record.clone(),
                old_row: change.old_record.clone(),
                channel_key: slot.key().clone(),
            };
            if slot.bindings.wants_change(&event) {
                forward(&slot.tx, slot.key(), InboundEvent::Change(event));
            }
        }
    }

    async fn dispatch_presence(&self, key: &ChannelKey, envelope: PresenceEnvelope) {
        if !self.channels.get(key).is_some_and(|slot| slot.bindings.presence) {
            return;
        }
        let delta = match envelope.notice {
            PresenceNotice::Join => PresenceEvent::Join(vec![envelope.entry]),
            PresenceNotice::Leave => PresenceEvent::Leave(vec![envelope.entry]),
        };
        let snapshot = match self.presence_snapshot(key).await {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(error = %e, channel = %key, "Failed to refresh presence snapshot");
                None
            }
        };
        if let Some(slot) = self.channels.get(key) {
            forward(&slot.tx, key, InboundEvent::Presence(delta));
            if let Some(entries) = snapshot {
                *slot.presence.lock() = entries.clone();
                forward(&slot.tx, key, InboundEvent::Presence(PresenceEvent::Sync(entries)));
            }
        }
    }
}

/// Transport over Redis pub/sub.
///
/// One pattern subscription (`{prefix}rt:*`) carries every channel of this
/// process; a multiplexed connection is used for publishing and presence.
pub struct RedisTransport {
    client: RedisClient,
    user_id: UserId,
    session: String,
    shared: Arc<Shared>,
    events: broadcast::Sender<TransportEvent>,
    reader: Mutex<Option<CancellationToken>>,
}

impl RedisTransport {
    /// `event_buffer` bounds each channel's inbound queue
    pub fn new(
        redis_url: &str,
        key_prefix: &str,
        op_timeout: Duration,
        event_buffer: usize,
        user_id: UserId,
    ) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::TransportOpenFailure(format!("Invalid Redis URL: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            client,
            user_id,
            session: carelink_core::models::generate_id(),
            shared: Arc::new(Shared {
                prefix: key_prefix.to_string(),
                op_timeout,
                event_buffer,
                conn: Mutex::new(None),
                channels: DashMap::new(),
                orphaned: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            events,
            reader: Mutex::new(None),
        })
    }

    fn stop_reader(&self) {
        if let Some(token) = self.reader.lock().take() {
            token.cancel();
        }
    }

    /// Remove presence fields left behind when the previous connection died
    async fn purge_orphaned(&self) {
        let orphaned = std::mem::take(&mut *self.shared.orphaned.lock());
        for key in orphaned {
            let presence_ref = presence_ref(&self.session, &key);
            if let Err(e) = remove_presence(&self.shared, &key, &presence_ref, &self.user_id).await {
                warn!(error = %e, channel = %key, "Failed to remove orphaned presence");
                self.shared.orphaned.lock().push(key);
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> Result<()> {
        self.stop_reader();
        let op_timeout = self.shared.op_timeout;

        let conn = timeout(op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::TransportOpenFailure("Timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::TransportOpenFailure(format!("Failed to connect to Redis: {e}")))?;

        let mut pubsub = timeout(op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| {
                Error::TransportOpenFailure("Timed out opening Redis Pub/Sub connection".to_string())
            })?
            .map_err(|e| {
                Error::TransportOpenFailure(format!("Failed to open Redis Pub/Sub connection: {e}"))
            })?;

        let pattern = self.shared.pattern();
        timeout(op_timeout, pubsub.psubscribe(&pattern))
            .await
            .map_err(|_| Error::TransportOpenFailure(format!("Timed out subscribing to {pattern}")))?
            .map_err(|e| Error::TransportOpenFailure(format!("Failed to subscribe to {pattern}: {e}")))?;

        *self.shared.conn.lock() = Some(conn);

        let token = CancellationToken::new();
        *self.reader.lock() = Some(token.clone());

        let shared = self.shared.clone();
        let session = self.session.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    () = token.cancelled() => {
                        debug!("Redis reader cancelled");
                        return;
                    }
                    msg = stream.next() => msg,
                };
                let Some(msg) = msg else { break };

                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel = %channel, "Invalid payload");
                        continue;
                    }
                };
                shared.dispatch(&session, &channel, &payload).await;
            }

            // Stream returned None: the Redis connection was lost
            error!("Redis subscriber stream ended (connection lost)");
            shared.conn.lock().take();
            let lost: Vec<ChannelKey> = shared.channels.iter().map(|s| s.key().clone()).collect();
            shared.channels.clear();
            shared.orphaned.lock().extend(lost);
            let _ = events.send(TransportEvent::Closed {
                reason: "redis pub/sub stream ended".to_string(),
            });
        });

        self.purge_orphaned().await;
        info!(pattern = %pattern, "Redis transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop_reader();
        let keys: Vec<ChannelKey> = self.shared.channels.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if self.shared.channels.remove(&key).is_some() {
                let presence_ref = presence_ref(&self.session, &key);
                if let Err(e) = remove_presence(&self.shared, &key, &presence_ref, &self.user_id).await {
                    debug!(error = %e, channel = %key, "Presence cleanup on disconnect failed");
                    self.shared.orphaned.lock().push(key);
                }
            }
        }
        self.shared.conn.lock().take();
        info!("Redis transport disconnected");
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn open_channel(
        &self,
        key: &ChannelKey,
        bindings: ChannelBindings,
    ) -> Result<OpenedChannel> {
        if self.shared.conn.lock().is_none() {
            return Err(Error::TransportOpenFailure(format!(
                "cannot open {key}: Redis transport not connected"
            )));
        }

        let (tx, rx) = inbound_queue(self.shared.event_buffer);
        let presence = Arc::new(Mutex::new(Vec::new()));
        if bindings.presence {
            let entries = self
                .shared
                .presence_snapshot(key)
                .await
                .map_err(|e| Error::TransportOpenFailure(e.to_string()))?;
            *presence.lock() = entries.clone();
            forward(&tx, key, InboundEvent::Presence(PresenceEvent::Sync(entries)));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.channels.insert(
            key.clone(),
            RedisSlot {
                id,
                bindings,
                tx,
                presence: presence.clone(),
            },
        );
        debug!(channel = %key, "Redis channel opened");

        let channel = RedisChannel {
            shared: self.shared.clone(),
            key: key.clone(),
            slot_id: id,
            presence_ref: presence_ref(&self.session, key),
            user_id: self.user_id.clone(),
            session: self.session.clone(),
            presence,
            refresh: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        Ok(OpenedChannel {
            channel: Arc::new(channel),
            events: rx,
        })
    }

    fn active_channel_count(&self) -> usize {
        self.shared.channels.len()
    }
}

/// Drop our presence field and tell the other participants we left
async fn remove_presence(
    shared: &Shared,
    key: &ChannelKey,
    presence_ref: &str,
    user_id: &UserId,
) -> Result<()> {
    let hash = shared.presence_hash(key);
    let mut conn = shared.connection()?;
    let removed: usize = timeout(shared.op_timeout, conn.hdel(&hash, presence_ref))
        .await
        .map_err(|_| Error::WriteFailure(format!("Timed out writing {hash}")))?
        .map_err(|e| Error::WriteFailure(format!("Failed to write {hash}: {e}")))?;

    if removed > 0 {
        let notice = serde_json::to_string(&PresenceEnvelope {
            notice: PresenceNotice::Leave,
            entry: PresenceEntry {
                user_id: user_id.clone(),
                presence_ref: presence_ref.to_string(),
                metadata: serde_json::Value::Null,
                online_at: Utc::now(),
            },
        })?;
        shared.publish(&shared.presence_channel(key), &notice).await?;
    }
    Ok(())
}

struct RedisChannel {
    shared: Arc<Shared>,
    key: ChannelKey,
    slot_id: u64,
    presence_ref: String,
    user_id: UserId,
    session: String,
    presence: Arc<Mutex<Vec<PresenceEntry>>>,
    /// Keeps our presence field from expiring while tracked
    refresh: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl RedisChannel {
    fn stop_refresh(&self) {
        if let Some(token) = self.refresh.lock().take() {
            token.cancel();
        }
    }

    fn start_refresh(&self, entry: PresenceEntry) {
        let token = CancellationToken::new();
        if let Some(previous) = self.refresh.lock().replace(token.clone()) {
            previous.cancel();
        }
        let shared = self.shared.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + PRESENCE_REFRESH,
                PRESENCE_REFRESH,
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.write_presence(&key, &entry).await {
                            debug!(error = %e, channel = %key, "Presence refresh failed");
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TransportChannel for RedisChannel {
    fn key(&self) -> &ChannelKey {
        &self.key
    }

    async fn track(&self, payload: serde_json::Value) -> Result<()> {
        let entry = PresenceEntry {
            user_id: self.user_id.clone(),
            presence_ref: self.presence_ref.clone(),
            metadata: payload,
            online_at: Utc::now(),
        };
        self.shared.write_presence(&self.key, &entry).await?;
        self.start_refresh(entry.clone());

        let notice = serde_json::to_string(&PresenceEnvelope {
            notice: PresenceNotice::Join,
            entry,
        })?;
        self.shared
            .publish(&self.shared.presence_channel(&self.key), &notice)
            .await?;
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        self.stop_refresh();
        remove_presence(&self.shared, &self.key, &self.presence_ref, &self.user_id).await
    }

    async fn send(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WriteFailure(format!("channel {} is closed", self.key)));
        }
        let envelope = serde_json::to_string(&BroadcastEnvelope {
            session: self.session.clone(),
            event: event.to_string(),
            payload,
        })?;
        let subscribers = self
            .shared
            .publish(&self.shared.broadcast_channel(&self.key), &envelope)
            .await?;
        debug!(channel = %self.key, event = %event, subscribers, "Broadcast published to Redis");
        Ok(())
    }

    fn presence_state(&self) -> Vec<PresenceEntry> {
        self.presence.lock().clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared
            .channels
            .remove_if(&self.key, |_, slot| slot.id == self.slot_id);
        if let Err(e) = self.untrack().await {
            debug!(error = %e, channel = %self.key, "Presence cleanup on close failed");
        }
    }
}
