//! Ephemeral "is typing" state per conversation.
//!
//! Typing changes travel as `typing` broadcasts on the conversation's channel
//! and are never persisted. A local `true` arms an auto-clear timer; if the
//! user goes quiet for the timeout the service broadcasts `false` on their
//! behalf. Remote state is last-writer-wins on `updated_at`.

use carelink_core::models::{ConversationId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::ChannelKey;
use crate::clock::Clock;
use crate::error::Result;
use crate::events::BroadcastMessage;
use crate::registry::{ChannelObserver, ChannelRegistry};

/// Broadcast event name carrying [`TypingIndicator`] payloads
pub const TYPING_EVENT: &str = "typing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

struct ClearTimer {
    generation: u64,
    token: CancellationToken,
}

pub struct TypingIndicatorService {
    user_id: UserId,
    registry: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    indicators: DashMap<(ConversationId, UserId), TypingIndicator>,
    timers: Mutex<HashMap<ConversationId, ClearTimer>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl TypingIndicatorService {
    /// Create the service and hook it into `registry` so it sees typing
    /// broadcasts on conversation channels.
    pub fn new(
        user_id: UserId,
        registry: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            user_id,
            registry: registry.clone(),
            clock,
            timeout,
            indicators: DashMap::new(),
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        let observer: Arc<dyn ChannelObserver> = service.clone();
        registry.add_observer(Arc::downgrade(&observer));
        service
    }

    /// Publish our typing state for `conversation`.
    ///
    /// `true` (re)starts the auto-clear timer, `false` cancels it. The
    /// conversation must be subscribed; otherwise `ChannelNotFound`. A failed
    /// broadcast leaves the previous timer armed.
    pub async fn set_typing(
        self: &Arc<Self>,
        conversation: &ConversationId,
        is_typing: bool,
    ) -> Result<()> {
        let indicator = TypingIndicator {
            conversation_id: conversation.clone(),
            user_id: self.user_id.clone(),
            is_typing,
            updated_at: self.clock.now(),
        };

        self.publish(&indicator).await?;

        self.cancel_timer(conversation);
        self.indicators
            .insert((conversation.clone(), self.user_id.clone()), indicator);
        if is_typing {
            self.arm_timer(conversation);
        }
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, conversation: &ConversationId) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let deadline = tokio::time::Instant::now() + self.timeout;
        self.timers.lock().insert(
            conversation.clone(),
            ClearTimer {
                generation,
                token: token.clone(),
            },
        );

        let service = Arc::clone(self);
        let conversation = conversation.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    service.expire(&conversation, generation).await;
                }
            }
        });
    }

    fn cancel_timer(&self, conversation: &ConversationId) {
        if let Some(timer) = self.timers.lock().remove(conversation) {
            timer.token.cancel();
        }
    }

    async fn expire(&self, conversation: &ConversationId, generation: u64) {
        {
            let mut timers = self.timers.lock();
            match timers.get(conversation) {
                Some(timer) if timer.generation == generation => {
                    timers.remove(conversation);
                }
                _ => return,
            }
        }

        debug!(conversation = %conversation, "Typing timed out");
        let indicator = TypingIndicator {
            conversation_id: conversation.clone(),
            user_id: self.user_id.clone(),
            is_typing: false,
            updated_at: self.clock.now(),
        };
        self.indicators.insert(
            (conversation.clone(), self.user_id.clone()),
            indicator.clone(),
        );
        if let Err(e) = self.publish(&indicator).await {
            warn!(conversation = %conversation, error = %e, "Failed to clear typing state");
        }
    }

    async fn publish(&self, indicator: &TypingIndicator) -> Result<()> {
        let key = ChannelKey::conversation(&indicator.conversation_id);
        let payload = serde_json::to_value(indicator)?;
        self.registry.broadcast(&key, TYPING_EVENT, payload).await
    }

    /// Fold in another participant's state; older updates never overwrite
    /// newer ones. Returns whether the update was kept.
    pub fn apply_remote(&self, indicator: TypingIndicator) -> bool {
        use dashmap::mapref::entry::Entry;

        let key = (indicator.conversation_id.clone(), indicator.user_id.clone());
        match self.indicators.entry(key) {
            Entry::Occupied(mut current) => {
                if current.get().updated_at > indicator.updated_at {
                    debug!(
                        conversation = %indicator.conversation_id,
                        user = %indicator.user_id,
                        "Dropping stale typing update"
                    );
                    return false;
                }
                current.insert(indicator);
            }
            Entry::Vacant(slot) => {
                slot.insert(indicator);
            }
        }
        true
    }

    /// Whether `user` is typing right now; state older than the timeout
    /// counts as not typing even if no `false` ever arrived.
    #[must_use]
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.indicators
            .get(&(conversation.clone(), user.clone()))
            .is_some_and(|indicator| self.is_active(&indicator))
    }

    /// Other participants currently typing in `conversation`, sorted
    #[must_use]
    pub fn typing_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .indicators
            .iter()
            .filter(|e| e.key().0 == *conversation && e.key().1 != self.user_id)
            .filter(|e| self.is_active(e.value()))
            .map(|e| e.key().1.clone())
            .collect();
        users.sort();
        users
    }

    fn is_active(&self, indicator: &TypingIndicator) -> bool {
        if !indicator.is_typing {
            return false;
        }
        // A timestamp ahead of our clock is not stale
        (self.clock.now() - indicator.updated_at)
            .to_std()
            .map_or(true, |age| age <= self.timeout)
    }

    /// Forget everything about a conversation and stop its timer
    pub fn clear_conversation(&self, conversation: &ConversationId) {
        self.cancel_timer(conversation);
        self.indicators.retain(|(c, _), _| c != conversation);
    }

    /// Stop every pending auto-clear timer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.timers.lock().clear();
    }
}

impl ChannelObserver for TypingIndicatorService {
    fn broadcast_events(&self, key: &ChannelKey) -> Vec<String> {
        if key.conversation_id().is_some() {
            vec![TYPING_EVENT.to_string()]
        } else {
            Vec::new()
        }
    }

    fn on_broadcast(&self, key: &ChannelKey, message: &BroadcastMessage) {
        if message.event != TYPING_EVENT {
            return;
        }
        let indicator: TypingIndicator = match serde_json::from_value(message.payload.clone()) {
            Ok(indicator) => indicator,
            Err(e) => {
                warn!(channel = %key, error = %e, "Malformed typing payload");
                return;
            }
        };
        if key.conversation_id().as_ref() != Some(&indicator.conversation_id) {
            warn!(channel = %key, conversation = %indicator.conversation_id, "Typing payload for another conversation");
            return;
        }
        self.apply_remote(indicator);
    }

    fn on_channel_removed(&self, key: &ChannelKey) {
        if let Some(conversation) = key.conversation_id() {
            self.clear_conversation(&conversation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SubscriptionConfig;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::transport::{MemoryTransport, Transport};

    struct Fixture {
        transport: MemoryTransport,
        registry: Arc<ChannelRegistry>,
        clock: ManualClock,
        typing: Arc<TypingIndicatorService>,
        conversation: ConversationId,
    }

    async fn fixture() -> Fixture {
        let transport = MemoryTransport::new(UserId::from("nurse-1"));
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(transport.clone()),
            Duration::from_millis(100),
        ));
        let clock = ManualClock::default();
        let typing = TypingIndicatorService::new(
            UserId::from("nurse-1"),
            registry.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(10),
        );
        transport.connect().await.unwrap();
        registry.recreate_all().await;

        let conversation = ConversationId::from("c1");
        registry
            .subscribe(ChannelKey::conversation(&conversation), SubscriptionConfig::new())
            .await
            .unwrap();
        Fixture {
            transport,
            registry,
            clock,
            typing,
            conversation,
        }
    }

    fn sent_states(transport: &MemoryTransport) -> Vec<bool> {
        transport
            .sent_broadcasts()
            .into_iter()
            .filter(|(_, m)| m.event == TYPING_EVENT)
            .map(|(_, m)| m.payload["isTyping"].as_bool().unwrap())
            .collect()
    }

    fn remote(conversation: &ConversationId, user: &str, typing: bool, at: DateTime<Utc>) -> TypingIndicator {
        TypingIndicator {
            conversation_id: conversation.clone(),
            user_id: UserId::from(user),
            is_typing: typing,
            updated_at: at,
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_clear_after_timeout() {
        let f = fixture().await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();
        assert_eq!(sent_states(&f.transport), vec![true]);

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true]);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystroke_restarts_timer() {
        let f = fixture().await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true, true]);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_timer() {
        let f = fixture().await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();
        f.typing.set_typing(&f.conversation, false).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_cancels_timer() {
        let f = fixture().await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();
        f.registry
            .unsubscribe(&ChannelKey::conversation(&f.conversation))
            .await;

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keep_alive_keeps_auto_clear() {
        let f = fixture().await;
        f.typing.set_typing(&f.conversation, true).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        // Keep-alive while the channel is being rebuilt
        f.registry.suspend_all().await;
        let err = f.typing.set_typing(&f.conversation, true).await.unwrap_err();
        assert!(matches!(err, Error::WriteFailure(_)));
        f.registry.recreate_all().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(sent_states(&f.transport), vec![true, false]);
    }

    #[tokio::test]
    async fn test_unsubscribed_conversation_rejected() {
        let f = fixture().await;
        let err = f
            .typing
            .set_typing(&ConversationId::from("other"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_remote_update_dropped() {
        let f = fixture().await;
        let now = f.clock.now();

        assert!(f.typing.apply_remote(remote(&f.conversation, "doctor-1", true, now)));
        assert!(!f.typing.apply_remote(remote(
            &f.conversation,
            "doctor-1",
            false,
            now - chrono::Duration::seconds(1)
        )));
        assert!(f.typing.is_typing(&f.conversation, &UserId::from("doctor-1")));
        assert_eq!(f.typing.typing_users(&f.conversation), vec![UserId::from("doctor-1")]);
    }

    #[tokio::test]
    async fn test_stale_state_reads_as_not_typing() {
        let f = fixture().await;
        let doctor = UserId::from("doctor-1");
        f.typing
            .apply_remote(remote(&f.conversation, "doctor-1", true, f.clock.now()));
        assert!(f.typing.is_typing(&f.conversation, &doctor));

        f.clock.advance(chrono::Duration::seconds(11));
        assert!(!f.typing.is_typing(&f.conversation, &doctor));
        assert!(f.typing.typing_users(&f.conversation).is_empty());
    }

    #[tokio::test]
    async fn test_remote_broadcast_applied() {
        let f = fixture().await;
        let key = ChannelKey::conversation(&f.conversation);
        let payload =
            serde_json::to_value(remote(&f.conversation, "doctor-1", true, f.clock.now())).unwrap();
        assert_eq!(f.transport.emit_broadcast(&key, TYPING_EVENT, payload), 1);
        settle().await;

        assert!(f.typing.is_typing(&f.conversation, &UserId::from("doctor-1")));
    }
}
