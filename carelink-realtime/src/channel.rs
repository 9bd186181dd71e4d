//! Subscription blueprints: channel keys, table/broadcast/presence watches and
//! the bindings a transport needs to open a live channel.

use carelink_core::models::{ConversationId, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::{BroadcastMessage, ChangeDelivery, ChangeEvent, PresenceEntry, WatchEvent};

/// Stable identifier of a logical subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `conversation-<id>`
    #[must_use]
    pub fn conversation(id: &ConversationId) -> Self {
        Self(format!("conversation-{id}"))
    }

    /// `patient-monitoring-<tenant>`
    #[must_use]
    pub fn patient_monitoring(tenant: &TenantId) -> Self {
        Self(format!("patient-monitoring-{tenant}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conversation id for keys of the form `conversation-<id>`
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.0
            .strip_prefix("conversation-")
            .filter(|id| !id.is_empty())
            .map(ConversationId::from)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub type ChangeCallback = Arc<dyn Fn(ChangeDelivery) + Send + Sync>;
pub type BroadcastCallback = Arc<dyn Fn(BroadcastMessage) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(Vec<PresenceEntry>) + Send + Sync>;

/// Row filter in the `column=op.value` form understood by the change feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
}

impl RowFilter {
    /// Parse `conversation_id=eq.42`
    #[must_use]
    pub fn parse(filter: &str) -> Option<Self> {
        let (column, rest) = filter.split_once('=')?;
        let (op, value) = rest.split_once('.')?;
        let op = match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            _ => return None,
        };
        let column = column.trim();
        if column.is_empty() {
            return None;
        }
        Some(Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
        })
    }

    /// Compare against the row's column rendered as text
    #[must_use]
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        let actual = match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let equal = actual.as_deref() == Some(self.value.as_str());
        match self.op {
            FilterOp::Eq => equal,
            FilterOp::Neq => !equal,
        }
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
        };
        write!(f, "{}={}.{}", self.column, op, self.value)
    }
}

/// Watch on row changes of one table
#[derive(Clone)]
pub struct TableWatch {
    pub(crate) table: String,
    pub(crate) event: WatchEvent,
    pub(crate) filter: Option<RowFilter>,
    /// Filter text that did not parse; the watch matches nothing and
    /// subscribing rejects it
    pub(crate) rejected_filter: Option<String>,
    /// `None` falls back to the registry default
    pub(crate) debounce: Option<Duration>,
    pub(crate) callback: ChangeCallback,
}

impl TableWatch {
    pub fn new<F>(table: impl Into<String>, event: WatchEvent, callback: F) -> Self
    where
        F: Fn(ChangeDelivery) + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            event,
            filter: None,
            rejected_filter: None,
            debounce: None,
            callback: Arc::new(callback),
        }
    }

    /// Restrict to rows matching `column=eq.value` or `column=neq.value`.
    ///
    /// Anything else makes [`SubscriptionConfig::validate`] fail, so a
    /// subscription never widens to the whole table.
    #[must_use]
    pub fn filter(mut self, filter: &str) -> Self {
        match RowFilter::parse(filter) {
            Some(parsed) => {
                self.filter = Some(parsed);
                self.rejected_filter = None;
            }
            None => {
                self.filter = None;
                self.rejected_filter = Some(filter.to_string());
            }
        }
        self
    }

    /// Debounce window. Zero still coalesces over [`crate::batcher::MIN_WINDOW`].
    #[must_use]
    pub const fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub const fn event(&self) -> WatchEvent {
        self.event
    }

    pub(crate) fn accepts(&self, event: &ChangeEvent) -> bool {
        self.rejected_filter.is_none()
            && self.table == event.table
            && self.event.matches(event.event_type)
            && self.filter.as_ref().is_none_or(|f| f.matches(&event.row))
    }
}

impl std::fmt::Debug for TableWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableWatch")
            .field("table", &self.table)
            .field("event", &self.event)
            .field("filter", &self.filter)
            .field("rejected_filter", &self.rejected_filter)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct BroadcastWatch {
    pub(crate) event: String,
    pub(crate) callback: BroadcastCallback,
}

impl std::fmt::Debug for BroadcastWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastWatch")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Presence tracking request: what to publish about ourselves and whom to notify
#[derive(Clone, Default)]
pub struct PresenceSpec {
    pub(crate) initial_state: serde_json::Value,
    pub(crate) on_sync: Option<PresenceCallback>,
    pub(crate) on_join: Option<PresenceCallback>,
    pub(crate) on_leave: Option<PresenceCallback>,
}

impl PresenceSpec {
    #[must_use]
    pub fn new(initial_state: serde_json::Value) -> Self {
        Self {
            initial_state,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn on_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        self.on_sync = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_join<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        self.on_join = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_leave<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        self.on_leave = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for PresenceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSpec")
            .field("initial_state", &self.initial_state)
            .finish_non_exhaustive()
    }
}

/// Blueprint of a logical subscription.
///
/// Once handed to the registry it is never modified; recreating a live channel
/// after reconnection replays exactly this value. Replacing it requires
/// unsubscribe + subscribe.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    pub(crate) tables: Vec<TableWatch>,
    pub(crate) broadcasts: Vec<BroadcastWatch>,
    pub(crate) presence: Option<PresenceSpec>,
}

impl SubscriptionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn watch_table(mut self, watch: TableWatch) -> Self {
        self.tables.push(watch);
        self
    }

    #[must_use]
    pub fn on_broadcast<F>(mut self, event: impl Into<String>, callback: F) -> Self
    where
        F: Fn(BroadcastMessage) + Send + Sync + 'static,
    {
        self.broadcasts.push(BroadcastWatch {
            event: event.into(),
            callback: Arc::new(callback),
        });
        self
    }

    #[must_use]
    pub fn with_presence(mut self, presence: PresenceSpec) -> Self {
        self.presence = Some(presence);
        self
    }

    #[must_use]
    pub fn tables(&self) -> &[TableWatch] {
        &self.tables
    }

    /// Reject watches whose row filter could not be parsed
    pub fn validate(&self) -> Result<()> {
        match self
            .tables
            .iter()
            .find_map(|w| w.rejected_filter.as_ref().map(|f| (w, f)))
        {
            Some((watch, filter)) => Err(Error::InvalidFilter {
                table: watch.table.clone(),
                filter: filter.clone(),
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn tracks_presence(&self) -> bool {
        self.presence.is_some()
    }

    /// What the transport needs to know to open the live channel
    #[must_use]
    pub fn bindings(&self) -> ChannelBindings {
        ChannelBindings {
            tables: self
                .tables
                .iter()
                .map(|w| TableBinding {
                    table: w.table.clone(),
                    event: w.event,
                    filter: w.filter.clone(),
                })
                .collect(),
            broadcast_events: self.broadcasts.iter().map(|w| w.event.clone()).collect(),
            presence: self.presence.is_some(),
        }
    }
}

/// Transport-level listener registration derived from a [`SubscriptionConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelBindings {
    pub tables: Vec<TableBinding>,
    pub broadcast_events: Vec<String>,
    pub presence: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub table: String,
    pub event: WatchEvent,
    pub filter: Option<RowFilter>,
}

impl ChannelBindings {
    /// Whether a row change should be delivered to this channel
    #[must_use]
    pub fn wants_change(&self, event: &ChangeEvent) -> bool {
        self.tables.iter().any(|b| {
            b.table == event.table
                && b.event.matches(event.event_type)
                && b.filter.as_ref().is_none_or(|f| f.matches(&event.row))
        })
    }

    #[must_use]
    pub fn wants_broadcast(&self, event: &str) -> bool {
        self.broadcast_events.iter().any(|e| e == event)
    }
}
