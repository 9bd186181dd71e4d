use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::debug;

use crate::channel::ChannelKey;
use crate::events::{PresenceEntry, PresenceEvent};

/// Per-channel view of who is attached.
///
/// `Sync` replaces a channel's set wholesale, `Join`/`Leave` patch it by
/// presence ref. Only channels registered with [`start_tracking`] are kept;
/// events for anything else are dropped.
///
/// [`start_tracking`]: PresenceTracker::start_tracking
#[derive(Debug, Default)]
pub struct PresenceTracker {
    channels: DashMap<ChannelKey, Vec<PresenceEntry>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_tracking(&self, key: &ChannelKey) {
        self.channels.entry(key.clone()).or_default();
    }

    pub fn stop_tracking(&self, key: &ChannelKey) {
        if self.channels.remove(key).is_some() {
            debug!(channel = %key, "Dropped presence state");
        }
    }

    #[must_use]
    pub fn is_tracking(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    /// Fold a transport notification into the channel's set.
    /// Returns false if the channel is not tracked.
    pub fn apply(&self, key: &ChannelKey, event: &PresenceEvent) -> bool {
        let Some(mut entries) = self.channels.get_mut(key) else {
            return false;
        };
        match event {
            PresenceEvent::Sync(snapshot) => {
                *entries = snapshot.clone();
            }
            PresenceEvent::Join(joined) => {
                for entry in joined {
                    match entries
                        .iter_mut()
                        .find(|e| e.presence_ref == entry.presence_ref)
                    {
                        Some(existing) => *existing = entry.clone(),
                        None => entries.push(entry.clone()),
                    }
                }
            }
            PresenceEvent::Leave(left) => {
                entries.retain(|e| !left.iter().any(|l| l.presence_ref == e.presence_ref));
            }
        }
        debug!(channel = %key, kind = event.event_type(), present = entries.len(), "Presence updated");
        true
    }

    /// Every attached session, in arrival order
    #[must_use]
    pub fn snapshot(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        self.channels
            .get(key)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// One entry per user (their most recent session), sorted by user id
    #[must_use]
    pub fn online_users(&self, key: &ChannelKey) -> Vec<PresenceEntry> {
        let Some(entries) = self.channels.get(key) else {
            return Vec::new();
        };
        let mut users: BTreeMap<_, PresenceEntry> = BTreeMap::new();
        for entry in entries.iter() {
            match users.get(&entry.user_id) {
                Some(seen) if seen.online_at >= entry.online_at => {}
                _ => {
                    users.insert(entry.user_id.clone(), entry.clone());
                }
            }
        }
        users.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_core::models::UserId;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn entry(user: &str, presence_ref: &str, minute: u32) -> PresenceEntry {
        PresenceEntry {
            user_id: UserId::from(user),
            presence_ref: presence_ref.to_string(),
            metadata: json!({ "tab": presence_ref }),
            online_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_untracked_channel_ignored() {
        let tracker = PresenceTracker::new();
        let key = ChannelKey::from("conversation-1");
        assert!(!tracker.apply(&key, &PresenceEvent::Join(vec![entry("u1", "a", 0)])));
        assert!(tracker.snapshot(&key).is_empty());
    }

    #[test]
    fn test_sync_replaces_and_deltas_patch() {
        let tracker = PresenceTracker::new();
        let key = ChannelKey::from("conversation-1");
        tracker.start_tracking(&key);

        tracker.apply(&key, &PresenceEvent::Sync(vec![entry("u1", "a", 0), entry("u2", "b", 1)]));
        tracker.apply(&key, &PresenceEvent::Join(vec![entry("u3", "c", 2)]));
        tracker.apply(&key, &PresenceEvent::Leave(vec![entry("u1", "a", 0)]));

        let refs: Vec<_> = tracker
            .snapshot(&key)
            .into_iter()
            .map(|e| e.presence_ref)
            .collect();
        assert_eq!(refs, vec!["b", "c"]);

        tracker.apply(&key, &PresenceEvent::Sync(vec![entry("u9", "z", 3)]));
        assert_eq!(tracker.snapshot(&key).len(), 1);
    }

    #[test]
    fn test_rejoin_replaces_same_ref() {
        let tracker = PresenceTracker::new();
        let key = ChannelKey::from("conversation-1");
        tracker.start_tracking(&key);

        tracker.apply(&key, &PresenceEvent::Join(vec![entry("u1", "a", 0)]));
        tracker.apply(&key, &PresenceEvent::Join(vec![entry("u1", "a", 5)]));
        let snapshot = tracker.snapshot(&key);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].online_at, entry("u1", "a", 5).online_at);
    }

    #[test]
    fn test_online_users_collapses_sessions() {
        let tracker = PresenceTracker::new();
        let key = ChannelKey::from("conversation-1");
        tracker.start_tracking(&key);
        tracker.apply(
            &key,
            &PresenceEvent::Sync(vec![
                entry("u2", "phone", 3),
                entry("u1", "tab-1", 1),
                entry("u1", "tab-2", 4),
            ]),
        );

        let users = tracker.online_users(&key);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id.as_str(), "u1");
        assert_eq!(users[0].presence_ref, "tab-2");
        assert_eq!(users[1].user_id.as_str(), "u2");

        // Copies, not views
        tracker.stop_tracking(&key);
        assert_eq!(users.len(), 2);
        assert!(tracker.online_users(&key).is_empty());
    }
}
