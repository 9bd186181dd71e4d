//! Durable per-user read receipts.
//!
//! Unlike typing and presence, receipts are written to the database. While a
//! write for a (message, user) pair is in flight, other calls in this process
//! skip that pair; the store's unique constraint makes every later or remote
//! repeat a no-op.

use async_trait::async_trait;
use carelink_core::models::{ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Persistence for read receipts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Insert receipts, ignoring pairs that already exist.
    /// Returns how many rows were actually written.
    async fn insert_receipts(&self, receipts: &[ReadReceipt]) -> Result<u64>;

    /// Messages in `conversation` sent by someone else and not yet read by `user`
    async fn unread_message_ids(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>>;
}

fn db_error(e: sqlx::Error) -> Error {
    Error::WriteFailure(e.to_string())
}

/// Receipt store backed by Postgres (see `migrations/`)
#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn insert_receipts(&self, receipts: &[ReadReceipt]) -> Result<u64> {
        if receipts.is_empty() {
            return Ok(0);
        }
        let message_ids: Vec<String> = receipts
            .iter()
            .map(|r| r.message_id.as_str().to_string())
            .collect();
        let user_ids: Vec<String> = receipts
            .iter()
            .map(|r| r.user_id.as_str().to_string())
            .collect();
        let read_at: Vec<DateTime<Utc>> = receipts.iter().map(|r| r.read_at).collect();

        let result = sqlx::query(
            "INSERT INTO message_read_receipts (message_id, user_id, read_at)
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[])
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_ids)
        .bind(user_ids)
        .bind(read_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn unread_message_ids(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let rows = sqlx::query(
            "SELECT m.id
             FROM messages m
             WHERE m.conversation_id = $1
               AND m.sender_id <> $2
               AND NOT EXISTS (
                   SELECT 1 FROM message_read_receipts r
                   WHERE r.message_id = m.id AND r.user_id = $2
               )
             ORDER BY m.created_at",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map(MessageId::from_string)
                    .map_err(db_error)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    conversation_id: ConversationId,
    sender_id: UserId,
}

/// In-memory receipt store for single-node runs and tests
#[derive(Debug, Default)]
pub struct MemoryReceiptStore {
    messages: Mutex<Vec<StoredMessage>>,
    receipts: Mutex<HashMap<(MessageId, UserId), ReadReceipt>>,
}

impl MemoryReceiptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message so it can show up as unread
    pub fn add_message(&self, id: MessageId, conversation_id: ConversationId, sender_id: UserId) {
        self.messages.lock().push(StoredMessage {
            id,
            conversation_id,
            sender_id,
        });
    }

    #[must_use]
    pub fn receipt(&self, message_id: &MessageId, user_id: &UserId) -> Option<ReadReceipt> {
        self.receipts
            .lock()
            .get(&(message_id.clone(), user_id.clone()))
            .cloned()
    }

    #[must_use]
    pub fn receipt_count(&self) -> usize {
        self.receipts.lock().len()
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn insert_receipts(&self, receipts: &[ReadReceipt]) -> Result<u64> {
        let mut stored = self.receipts.lock();
        let mut written = 0;
        for receipt in receipts {
            let key = (receipt.message_id.clone(), receipt.user_id.clone());
            if let std::collections::hash_map::Entry::Vacant(slot) = stored.entry(key) {
                slot.insert(receipt.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn unread_message_ids(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let receipts = self.receipts.lock();
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.conversation_id == *conversation && m.sender_id != *user)
            .filter(|m| !receipts.contains_key(&(m.id.clone(), user.clone())))
            .map(|m| m.id.clone())
            .collect())
    }
}

/// Marks messages read for the local user.
///
/// Failures are logged and swallowed: the caller sees zero receipts written
/// and may simply call again later. Concurrent calls never write the same
/// message twice; once a write settles, the store's idempotent insert keeps
/// repeats harmless.
pub struct ReadReceiptCoordinator {
    user_id: UserId,
    store: Arc<dyn ReceiptStore>,
    clock: Arc<dyn Clock>,
    /// Messages with a write in flight from this process
    in_flight: Mutex<HashSet<MessageId>>,
}

impl ReadReceiptCoordinator {
    pub fn new(user_id: UserId, store: Arc<dyn ReceiptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            user_id,
            store,
            clock,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the number of receipts written (0 or 1)
    pub async fn mark_read(&self, message_id: &MessageId) -> u64 {
        self.write(vec![message_id.clone()]).await
    }

    /// Mark every unread message of `conversation` sent by others.
    /// Returns the number of receipts written.
    pub async fn mark_conversation_read(&self, conversation: &ConversationId) -> u64 {
        let unread = match self
            .store
            .unread_message_ids(conversation, &self.user_id)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "Failed to load unread messages");
                return 0;
            }
        };
        let written = self.write(unread).await;
        if written > 0 {
            info!(conversation = %conversation, receipts = written, "Marked conversation read");
        }
        written
    }

    /// Whether a receipt write for `message_id` is currently in flight
    #[must_use]
    pub fn is_in_flight(&self, message_id: &MessageId) -> bool {
        self.in_flight.lock().contains(message_id)
    }

    /// Number of messages with a write in flight
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn claim(&self, ids: Vec<MessageId>) -> Vec<MessageId> {
        let mut in_flight = self.in_flight.lock();
        ids.into_iter().filter(|id| in_flight.insert(id.clone())).collect()
    }

    fn release(&self, ids: &[MessageId]) {
        let mut in_flight = self.in_flight.lock();
        for id in ids {
            in_flight.remove(id);
        }
    }

    async fn write(&self, ids: Vec<MessageId>) -> u64 {
        let ids = self.claim(ids);
        if ids.is_empty() {
            return 0;
        }

        let read_at = self.clock.now();
        let receipts: Vec<ReadReceipt> = ids
            .iter()
            .map(|id| ReadReceipt {
                message_id: id.clone(),
                user_id: self.user_id.clone(),
                read_at,
            })
            .collect();

        let result = self.store.insert_receipts(&receipts).await;
        self.release(&ids);
        match result {
            Ok(written) => {
                debug!(requested = ids.len(), written, "Wrote read receipts");
                written
            }
            Err(e) => {
                warn!(error = %e, messages = ids.len(), "Failed to write read receipts");
                0
            }
        }
    }
}
