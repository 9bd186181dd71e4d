//! Debounced coalescing of row-change storms.
//!
//! Events for the same [`BatchKey`] that arrive within one debounce window are
//! delivered to the table watch's callback together, in arrival order. The
//! first event of a window opens the batch and arms its timer; the flush
//! removes the batch so the next event starts a fresh window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::{ChangeCallback, ChannelKey};
use crate::events::{ChangeDelivery, ChangeEvent, ChangeKind};

/// Shortest window a batch stays open. A zero debounce means "as soon as
/// possible", which still gathers inserts landing a few milliseconds apart.
pub const MIN_WINDOW: Duration = Duration::from_millis(16);

/// Identity of a batch. `event` is the change's own kind, so a `*` watch keeps
/// inserts and deletes apart. `watch` is the table watch's position in its
/// subscription, so two watches on the same table never share a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub channel_key: ChannelKey,
    pub table: String,
    pub event: ChangeKind,
    pub watch: usize,
}

struct PendingBatch {
    generation: u64,
    events: Vec<ChangeEvent>,
    callback: ChangeCallback,
    timer: CancellationToken,
}

pub struct ChangeBatcher {
    batches: Mutex<HashMap<BatchKey, PendingBatch>>,
    default_window: Duration,
    generation: AtomicU64,
}

impl ChangeBatcher {
    #[must_use]
    pub fn new(default_window: Duration) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            default_window,
            generation: AtomicU64::new(0),
        }
    }

    /// Add an event to its batch, opening one if none is live.
    ///
    /// `window` of `None` uses the default; anything shorter than
    /// [`MIN_WINDOW`] is raised to it. `cancel` bounds the flush timer's
    /// lifetime (the owning subscription). Events arriving after it is
    /// cancelled are dropped.
    pub fn push(
        self: &Arc<Self>,
        key: BatchKey,
        event: ChangeEvent,
        window: Option<Duration>,
        callback: &ChangeCallback,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            trace!(channel = %key.channel_key, table = %key.table, "Dropping change for closed subscription");
            return;
        }

        let mut batches = self.batches.lock();
        if let Some(batch) = batches.get_mut(&key) {
            batch.events.push(event);
            trace!(channel = %key.channel_key, table = %key.table, size = batch.events.len(), "Appended to batch");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let window = window.unwrap_or(self.default_window).max(MIN_WINDOW);
        let deadline = tokio::time::Instant::now() + window;
        let timer = cancel.child_token();
        let batcher = Arc::clone(self);
        let timer_key = key.clone();
        let timer_token = timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    batcher.flush_generation(&timer_key, generation);
                }
            }
        });

        batches.insert(
            key,
            PendingBatch {
                generation,
                events: vec![event],
                callback: Arc::clone(callback),
                timer,
            },
        );
    }

    /// Only flush if the live batch is still the one the timer was armed for
    fn flush_generation(&self, key: &BatchKey, generation: u64) {
        let batch = {
            let mut batches = self.batches.lock();
            match batches.get(key) {
                Some(batch) if batch.generation == generation => batches.remove(key),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            Self::deliver(key, batch);
        }
    }

    fn deliver(key: &BatchKey, batch: PendingBatch) {
        let PendingBatch { events, callback, .. } = batch;
        let Some(delivery) = ChangeDelivery::from_events(events) else {
            return;
        };
        debug!(
            channel = %key.channel_key,
            table = %key.table,
            event = %key.event,
            events = delivery.len(),
            "Flushing change batch"
        );
        callback(delivery);
    }

    /// Drop every pending batch of a channel without delivering it
    pub fn cancel_channel(&self, channel_key: &ChannelKey) -> usize {
        let mut batches = self.batches.lock();
        let before = batches.len();
        batches.retain(|key, batch| {
            if key.channel_key != *channel_key {
                return true;
            }
            batch.timer.cancel();
            false
        });
        before - batches.len()
    }

    /// Number of live batches
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batches.lock().len()
    }
}
