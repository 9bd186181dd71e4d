use carelink_core::models::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKey;

/// Kind of row change reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which change kinds a table watch listens to (`*` for all)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEvent {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl WatchEvent {
    #[must_use]
    pub const fn matches(&self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (Self::All, _)
                | (Self::Insert, ChangeKind::Insert)
                | (Self::Update, ChangeKind::Update)
                | (Self::Delete, ChangeKind::Delete)
        )
    }
}

/// A single row change routed to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub event_type: ChangeKind,
    /// New row for inserts/updates, the removed row for deletes
    pub row: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<serde_json::Value>,
    pub channel_key: ChannelKey,
}

/// What a table-watch callback receives after one debounce window.
///
/// A window that saw exactly one event delivers it bare so callers that do
/// not care about batching can match on `Single` only.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDelivery {
    Single(ChangeEvent),
    Batch(Vec<ChangeEvent>),
}

impl ChangeDelivery {
    pub(crate) fn from_events(mut events: Vec<ChangeEvent>) -> Option<Self> {
        match events.len() {
            0 => None,
            1 => events.pop().map(Self::Single),
            _ => Some(Self::Batch(events)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(events) => events.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events in arrival order
    #[must_use]
    pub fn events(&self) -> &[ChangeEvent] {
        match self {
            Self::Single(event) => std::slice::from_ref(event),
            Self::Batch(events) => events,
        }
    }

    #[must_use]
    pub fn into_events(self) -> Vec<ChangeEvent> {
        match self {
            Self::Single(event) => vec![event],
            Self::Batch(events) => events,
        }
    }
}

/// Ephemeral message sent to everyone attached to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// One session of one participant attached to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    /// Distinguishes several sessions (tabs, devices) of the same user
    pub presence_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub online_at: DateTime<Utc>,
}

/// Presence notifications as delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Authoritative snapshot of everyone on the channel
    Sync(Vec<PresenceEntry>),
    Join(Vec<PresenceEntry>),
    Leave(Vec<PresenceEntry>),
}

impl PresenceEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
        }
    }
}

/// Everything a live channel can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Change(ChangeEvent),
    Broadcast(BroadcastMessage),
    Presence(PresenceEvent),
}

impl InboundEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Change(_) => "postgres_changes",
            Self::Broadcast(_) => "broadcast",
            Self::Presence(event) => event.event_type(),
        }
    }
}
