//! Seam between the realtime layer and the hosted pub/sub service.
//!
//! A transport owns one underlying connection and multiplexes logical
//! channels over it. It reports connection loss through [`TransportEvent`]s
//! and never retries on its own; retry policy belongs to the supervisor.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::channel::{ChannelBindings, ChannelKey};
use crate::error::Result;
use crate::events::{InboundEvent, PresenceEntry};

pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;

/// Inbound queue size per channel when none is configured
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Lifecycle notifications raised by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection dropped; every open channel is gone with it
    Closed { reason: String },
    /// Transport-level error that did not necessarily close the connection
    Error { message: String },
}

/// A live channel opened on the transport
pub struct OpenedChannel {
    pub channel: Arc<dyn TransportChannel>,
    pub events: mpsc::Receiver<InboundEvent>,
}

/// Bounded queue feeding one channel's dispatcher
pub(crate) fn inbound_queue(
    capacity: usize,
) -> (mpsc::Sender<InboundEvent>, mpsc::Receiver<InboundEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Queue an event for a channel without waiting. A full queue drops the
/// event so one slow consumer cannot stall the others.
pub(crate) fn forward(tx: &mpsc::Sender<InboundEvent>, key: &ChannelKey, event: InboundEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(
                channel = %key,
                kind = dropped.event_type(),
                capacity = tx.max_capacity(),
                "Inbound queue full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the underlying connection. Fails with `TransportOpenFailure`.
    async fn connect(&self) -> Result<()>;

    /// Close the underlying connection and drop every open channel
    async fn disconnect(&self);

    /// Subscribe to lifecycle notifications
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open a channel, attach the listeners described by `bindings` and wait
    /// for the service to acknowledge the subscription.
    async fn open_channel(&self, key: &ChannelKey, bindings: ChannelBindings)
        -> Result<OpenedChannel>;

    /// Number of low-level channels the transport currently believes are live
    fn active_channel_count(&self) -> usize;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn key(&self) -> &ChannelKey;

    /// Publish our own presence payload on this channel
    async fn track(&self, payload: serde_json::Value) -> Result<()>;

    async fn untrack(&self) -> Result<()>;

    /// Send a broadcast message to the other participants
    async fn send(&self, event: &str, payload: serde_json::Value) -> Result<()>;

    /// Current presence set as seen by the transport
    fn presence_state(&self) -> Vec<PresenceEntry>;

    /// Leave the channel. Idempotent.
    async fn close(&self);
}
