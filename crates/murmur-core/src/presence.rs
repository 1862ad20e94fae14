//! Presence tracking for Murmur.
//!
//! Tracks which usernames are online. Every mutation hands back a
//! [`PresenceUpdate`] carrying a snapshot taken under the same lock, which
//! callers use to persist the activity and broadcast the new state.

use murmur_protocol::{OnlineSet, PresenceEvent};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Result of a presence mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// The event that was applied.
    pub event: PresenceEvent,
    /// Whether the online set actually changed.
    pub changed: bool,
    /// The online set right after the mutation.
    pub snapshot: OnlineSet,
}

/// The set of online usernames.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: RwLock<OnlineSet>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a user online. Marking an online user again is a no-op.
    pub fn mark_online(&self, username: &str) -> PresenceUpdate {
        let mut online = self.online.write().unwrap_or_else(PoisonError::into_inner);
        let changed = online.insert(username.to_string(), true).is_none();
        if changed {
            debug!(username = %username, "Presence: user online");
        }

        PresenceUpdate {
            event: PresenceEvent::online(username),
            changed,
            snapshot: online.clone(),
        }
    }

    /// Mark a user offline. Marking an offline user again is a no-op.
    pub fn mark_offline(&self, username: &str) -> PresenceUpdate {
        let mut online = self.online.write().unwrap_or_else(PoisonError::into_inner);
        let changed = online.remove(username).is_some();
        if changed {
            debug!(username = %username, "Presence: user offline");
        }

        PresenceUpdate {
            event: PresenceEvent::offline(username),
            changed,
            snapshot: online.clone(),
        }
    }

    /// Apply a presence event.
    pub fn apply(&self, event: &PresenceEvent) -> PresenceUpdate {
        if event.online {
            self.mark_online(&event.username)
        } else {
            self.mark_offline(&event.username)
        }
    }

    /// Point-in-time copy of the online set.
    #[must_use]
    pub fn snapshot(&self) -> OnlineSet {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if a user is online.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    /// Number of online users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.online.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_online_offline() {
        let presence = PresenceTracker::new();

        assert!(presence.mark_online("alice").changed);
        assert!(!presence.mark_online("alice").changed);
        assert!(presence.is_online("alice"));
        assert_eq!(presence.len(), 1);

        let update = presence.mark_offline("alice");
        assert!(update.changed);
        assert!(update.snapshot.is_empty());
        assert!(!presence.mark_offline("alice").changed);
        assert!(presence.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let sequences: [&[bool]; 4] = [
            &[true],
            &[true, false],
            &[false, true, true],
            &[true, true, false, false, true, false],
        ];

        for ops in sequences {
            let presence = PresenceTracker::new();
            for &online in ops {
                let event = if online {
                    PresenceEvent::online("bob")
                } else {
                    PresenceEvent::offline("bob")
                };
                presence.apply(&event);
            }
            let last = *ops.last().unwrap();
            assert_eq!(presence.snapshot().contains_key("bob"), last, "ops: {ops:?}");
        }
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let presence = PresenceTracker::new();
        presence.mark_online("bob");

        let snapshot = presence.snapshot();
        presence.mark_online("carol");
        presence.mark_offline("bob");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("bob"), Some(&true));
    }

    #[test]
    fn test_update_snapshot_reflects_mutation() {
        let presence = PresenceTracker::new();
        presence.mark_online("bob");

        let update = presence.mark_online("carol");
        assert_eq!(update.event, PresenceEvent::online("carol"));
        assert_eq!(
            update.snapshot.keys().collect::<Vec<_>>(),
            vec!["bob", "carol"]
        );
    }

    #[test]
    fn test_concurrent_mutation_and_snapshot() {
        let presence = Arc::new(PresenceTracker::new());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let presence = Arc::clone(&presence);
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let name = format!("user-{i}-{}", j % 10);
                        presence.mark_online(&name);
                        if j % 3 == 0 {
                            presence.mark_offline(&name);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let snapshot = presence.snapshot();
            assert!(snapshot.values().all(|&online| online));
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert!(presence.len() <= 40);
    }
}
