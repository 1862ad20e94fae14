//! In-memory store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{ActivityKind, ActivityRecord, ChatStore, StoreError, StoredMessage};

/// Default number of records kept per kind.
const DEFAULT_CAPACITY: usize = 1000;

/// A store that keeps the most recent records in memory.
#[derive(Debug)]
pub struct MemoryStore {
    messages: Mutex<VecDeque<StoredMessage>>,
    activity: Mutex<VecDeque<ActivityRecord>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store keeping at most `capacity` messages and `capacity`
    /// activity records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            activity: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_message(
        &self,
        username: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: self.next_id(),
            username: username.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        let mut messages = self.messages.lock().await;
        push_bounded(&mut messages, stored.clone(), self.capacity);
        Ok(stored)
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().rev().take(limit).cloned().collect())
    }

    async fn save_activity(&self, username: &str, kind: ActivityKind) -> Result<(), StoreError> {
        let record = ActivityRecord {
            id: self.next_id(),
            username: username.to_string(),
            event_type: kind,
            timestamp: Utc::now(),
        };
        let mut activity = self.activity.lock().await;
        push_bounded(&mut activity, record, self.capacity);
        Ok(())
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>, StoreError> {
        let activity = self.activity.lock().await;
        Ok(activity.iter().rev().take(limit).cloned().collect())
    }
}
