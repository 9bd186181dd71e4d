//! In-process transport.
//!
//! Several [`MemoryTransport`]s created through [`MemoryTransport::peer`] share
//! one hub and see each other's broadcasts and presence, which makes it usable
//! both for single-node runs and as the injected fake in tests. Failure
//! injection hooks (`fail_next_connects`, `close`, `drop_channels_silently`)
//! drive the supervisor through its recovery paths.

use async_trait::async_trait;
use carelink_core::models::UserId;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    forward, inbound_queue, OpenedChannel, Transport, TransportChannel, TransportEvent,
    DEFAULT_EVENT_BUFFER,
};
use crate::channel::{ChannelBindings, ChannelKey};
use crate::error::{Error, Result};
use crate::events::{
    BroadcastMessage, ChangeEvent, ChangeKind, InboundEvent, PresenceEntry, PresenceEvent,
};

const EVENT_CAPACITY: usize = 64;

struct Slot {
    id: u64,
    session: u64,
    bindings: ChannelBindings,
    tx: mpsc::Sender<InboundEvent>,
}

/// State shared by every peer transport
#[derive(Default)]
struct MemoryHub {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelKey, Vec<Slot>>>,
    presence: Mutex<HashMap<ChannelKey, Vec<PresenceEntry>>>,
    sent: Mutex<Vec<(ChannelKey, BroadcastMessage)>>,
}

impl MemoryHub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn presence_snapshot(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        self.presence.lock().get(key).cloned().unwrap_or_default()
    }

    /// Deliver to every slot on `key` that passes `wants`, skipping `except`
    fn deliver<F>(&self, key: &ChannelKey, except: Option<u64>, event: &InboundEvent, wants: F) -> usize
    where
        F: Fn(&ChannelBindings) -> bool,
    {
        let channels = self.channels.lock();
        let Some(slots) = channels.get(key) else {
            return 0;
        };
        slots
            .iter()
            .filter(|slot| Some(slot.id) != except && wants(&slot.bindings))
            .filter(|slot| forward(&slot.tx, key, event.clone()))
            .count()
    }

    /// Send a delta followed by the resulting snapshot to presence listeners
    fn notify_presence(&self, key: &ChannelKey, delta: PresenceEvent) {
        let snapshot = PresenceEvent::Sync(self.presence_snapshot(key));
        self.deliver(key, None, &InboundEvent::Presence(delta), |b| b.presence);
        self.deliver(key, None, &InboundEvent::Presence(snapshot), |b| b.presence);
    }

    fn upsert_presence(&self, key: &ChannelKey, entry: PresenceEntry) {
        let mut presence = self.presence.lock();
        let entries = presence.entry(key.clone()).or_default();
        entries.retain(|e| e.presence_ref != entry.presence_ref);
        entries.push(entry);
    }

    fn remove_presence(&self, key: &ChannelKey, presence_ref: &str) -> Option<PresenceEntry> {
        let mut presence = self.presence.lock();
        let entries = presence.get_mut(key)?;
        let pos = entries.iter().position(|e| e.presence_ref == presence_ref)?;
        let removed = entries.remove(pos);
        if entries.is_empty() {
            presence.remove(key);
        }
        Some(removed)
    }

    /// Remove slots matching `pred` and return `(key, slot_id)` of each
    fn remove_slots<F>(&self, pred: F) -> Vec<(ChannelKey, u64)>
    where
        F: Fn(&Slot) -> bool,
    {
        let mut removed = Vec::new();
        let mut channels = self.channels.lock();
        for (key, slots) in channels.iter_mut() {
            slots.retain(|slot| {
                if pred(slot) {
                    removed.push((key.clone(), slot.id));
                    false
                } else {
                    true
                }
            });
        }
        channels.retain(|_, slots| !slots.is_empty());
        removed
    }
}

struct Session {
    id: u64,
    user_id: UserId,
    connected: AtomicBool,
    failures_remaining: AtomicU32,
    connect_calls: AtomicU32,
    event_buffer: usize,
    events: broadcast::Sender<TransportEvent>,
}

/// In-process pub/sub transport
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    session: Arc<Session>,
}

impl MemoryTransport {
    /// Create a transport on a fresh hub, acting as `user_id`
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self::with_event_buffer(user_id, DEFAULT_EVENT_BUFFER)
    }

    /// Like [`MemoryTransport::new`] with `event_buffer` queued events per channel
    #[must_use]
    pub fn with_event_buffer(user_id: UserId, event_buffer: usize) -> Self {
        Self::with_hub(Arc::new(MemoryHub::default()), user_id, event_buffer)
    }

    /// Another participant on the same hub
    #[must_use]
    pub fn peer(&self, user_id: UserId) -> Self {
        Self::with_hub(self.hub.clone(), user_id, self.session.event_buffer)
    }

    fn with_hub(hub: Arc<MemoryHub>, user_id: UserId, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Session {
            id: hub.next_id(),
            user_id,
            connected: AtomicBool::new(false),
            failures_remaining: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            event_buffer,
            events,
        };
        Self {
            hub,
            session: Arc::new(session),
        }
    }

    /// Make the next `n` calls to `connect` fail
    pub fn fail_next_connects(&self, n: u32) {
        self.session.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Total number of `connect` calls, successful or not
    #[must_use]
    pub fn connect_calls(&self) -> u32 {
        self.session.connect_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    /// Simulate the connection dropping: channels vanish and `Closed` is raised
    pub fn close(&self, reason: &str) {
        self.teardown();
        let _ = self.session.events.send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Simulate a transport-level error report
    pub fn raise_error(&self, message: &str) {
        let _ = self.session.events.send(TransportEvent::Error {
            message: message.to_string(),
        });
    }

    /// Lose every low-level channel without telling anyone
    pub fn drop_channels_silently(&self) {
        let session = self.session.id;
        self.hub.remove_slots(|slot| slot.session == session);
    }

    /// Inject a row change from the change feed. Returns how many channels received it.
    pub fn emit_change(&self, table: &str, kind: ChangeKind, row: serde_json::Value) -> usize {
        let keys: Vec<ChannelKey> = self.hub.channels.lock().keys().cloned().collect();
        keys.iter()
            .map(|key| {
                let event = ChangeEvent {
                    table: table.to_string(),
                    event_type: kind,
                    row: row.clone(),
                    old_row: None,
                    channel_key: key.clone(),
                };
                let wanted = |b: &ChannelBindings| b.wants_change(&event);
                self.hub
                    .deliver(key, None, &InboundEvent::Change(event.clone()), wanted)
            })
            .sum()
    }

    /// Inject a broadcast as if sent by a participant outside this process
    pub fn emit_broadcast(&self, key: &ChannelKey, event: &str, payload: serde_json::Value) -> usize {
        let message = InboundEvent::Broadcast(BroadcastMessage {
            event: event.to_string(),
            payload,
        });
        self.hub.deliver(key, None, &message, |b| b.wants_broadcast(event))
    }

    /// Add a remote participant's presence
    pub fn join_remote(&self, key: &ChannelKey, entry: PresenceEntry) {
        self.hub.upsert_presence(key, entry.clone());
        self.hub.notify_presence(key, PresenceEvent::Join(vec![entry]));
    }

    /// Remove a remote participant's presence session
    pub fn leave_remote(&self, key: &ChannelKey, presence_ref: &str) {
        if let Some(entry) = self.hub.remove_presence(key, presence_ref) {
            self.hub.notify_presence(key, PresenceEvent::Leave(vec![entry]));
        }
    }

    /// Every broadcast sent through any peer on this hub, in order
    #[must_use]
    pub fn sent_broadcasts(&self) -> Vec<(ChannelKey, BroadcastMessage)> {
        self.hub.sent.lock().clone()
    }

    fn teardown(&self) {
        self.session.connected.store(false, Ordering::SeqCst);
        let session = self.session.id;
        for (key, slot_id) in self.hub.remove_slots(|slot| slot.session == session) {
            if let Some(entry) = self.hub.remove_presence(&key, &presence_ref(slot_id)) {
                self.hub.notify_presence(&key, PresenceEvent::Leave(vec![entry]));
            }
        }
    }
}

fn presence_ref(slot_id: u64) -> String {
    format!("mem-{slot_id}")
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.session.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .session
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::TransportOpenFailure(
                "injected connect failure".to_string(),
            ));
        }
        self.session.connected.store(true, Ordering::SeqCst);
        debug!(session = self.session.id, "Memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown();
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.session.events.subscribe()
    }

    async fn open_channel(
        &self,
        key: &ChannelKey,
        bindings: ChannelBindings,
    ) -> Result<OpenedChannel> {
        if !self.is_connected() {
            return Err(Error::TransportOpenFailure(format!(
                "cannot open {key}: transport not connected"
            )));
        }

        let (tx, rx) = inbound_queue(self.session.event_buffer);
        let slot_id = self.hub.next_id();
        if bindings.presence {
            let snapshot = PresenceEvent::Sync(self.hub.presence_snapshot(key));
            forward(&tx, key, InboundEvent::Presence(snapshot));
        }
        self.hub
            .channels
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Slot {
                id: slot_id,
                session: self.session.id,
                bindings,
                tx,
            });

        let channel = MemoryChannel {
            hub: self.hub.clone(),
            session: self.session.clone(),
            key: key.clone(),
            slot_id,
            closed: AtomicBool::new(false),
        };
        Ok(OpenedChannel {
            channel: Arc::new(channel),
            events: rx,
        })
    }

    fn active_channel_count(&self) -> usize {
        let session = self.session.id;
        self.hub
            .channels
            .lock()
            .values()
            .flatten()
            .filter(|slot| slot.session == session)
            .count()
    }
}

struct MemoryChannel {
    hub: Arc<MemoryHub>,
    session: Arc<Session>,
    key: ChannelKey,
    slot_id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.session.connected.load(Ordering::SeqCst) {
            return Err(Error::WriteFailure(format!(
                "channel {} is not connected",
                self.key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn key(&self) -> &ChannelKey {
        &self.key
    }

    async fn track(&self, payload: serde_json::Value) -> Result<()> {
        self.ensure_usable()?;
        let entry = PresenceEntry {
            user_id: self.session.user_id.clone(),
            presence_ref: presence_ref(self.slot_id),
            metadata: payload,
            online_at: Utc::now(),
        };
        self.hub.upsert_presence(&self.key, entry.clone());
        self.hub
            .notify_presence(&self.key, PresenceEvent::Join(vec![entry]));
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        if let Some(entry) = self
            .hub
            .remove_presence(&self.key, &presence_ref(self.slot_id))
        {
            self.hub
                .notify_presence(&self.key, PresenceEvent::Leave(vec![entry]));
        }
        Ok(())
    }

    async fn send(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.ensure_usable()?;
        let message = BroadcastMessage {
            event: event.to_string(),
            payload,
        };
        self.hub.sent.lock().push((self.key.clone(), message.clone()));
        self.hub.deliver(
            &self.key,
            Some(self.slot_id),
            &InboundEvent::Broadcast(message),
            |b| b.wants_broadcast(event),
        );
        Ok(())
    }

    fn presence_state(&self) -> Vec<PresenceEntry> {
        self.hub.presence_snapshot(&self.key)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slot_id = self.slot_id;
        self.hub.remove_slots(|slot| slot.id == slot_id);
        let _ = self.untrack().await;
    }
}
