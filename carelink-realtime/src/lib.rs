//! Realtime synchronization for CareLink: resilient connection handling,
//! logical channel subscriptions that survive reconnects, debounced change
//! delivery, presence, typing indicators and read receipts.

pub mod backoff;
pub mod batcher;
pub mod channel;
pub mod client;
pub mod clock;
pub mod connection;
pub mod error;
pub mod events;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod transport;
pub mod typing;

pub use channel::{ChannelKey, PresenceSpec, SubscriptionConfig, TableWatch};
pub use client::RealtimeClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionState, ConnectionStatus, ConnectionSupervisor, ListenerHandle};
pub use error::{Error, Result};
pub use events::{
    BroadcastMessage, ChangeDelivery, ChangeEvent, ChangeKind, PresenceEntry, WatchEvent,
};
pub use receipts::{MemoryReceiptStore, PgReceiptStore, ReadReceipt, ReadReceiptCoordinator, ReceiptStore};
pub use registry::{ChannelRegistry, SubscriptionHandle};
pub use transport::{MemoryTransport, RedisTransport, Transport};
pub use typing::{TypingIndicator, TypingIndicatorService, TYPING_EVENT};
