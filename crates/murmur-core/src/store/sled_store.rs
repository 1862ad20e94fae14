//! Persistence backed by `sled`.
//!
//! Messages and activity records live in two trees. Keys are big-endian IDs
//! from `Db::generate_id`, so iteration order is insertion order and the
//! newest records are read by iterating in reverse.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::fmt;
use std::path::Path;
use tracing::debug;

use super::{ActivityKind, ActivityRecord, ChatStore, StoreError, StoredMessage};

const MESSAGES_TREE: &str = "messages";
const ACTIVITY_TREE: &str = "activity";

/// A durable store in a sled database.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
    activity: Tree,
    max_messages: Option<usize>,
}

impl SledStore {
    /// Open or create a database at `path`.
    ///
    /// When `max_messages` is set, the oldest messages are removed once the
    /// limit is exceeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>, max_messages: Option<usize>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let messages = db.open_tree(MESSAGES_TREE)?;
        let activity = db.open_tree(ACTIVITY_TREE)?;

        debug!(path = %path.as_ref().display(), "Opened sled store");

        Ok(Self {
            db,
            messages,
            activity,
            max_messages,
        })
    }

    fn insert<T: Serialize>(&self, tree: &Tree, id: u64, record: &T) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        tree.insert(id.to_be_bytes(), value)?;
        Ok(())
    }

    fn enforce_retention(&self) -> Result<(), StoreError> {
        if let Some(max) = self.max_messages {
            while self.messages.len() > max {
                if self.messages.pop_min()?.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn newest<T: DeserializeOwned>(tree: &Tree, limit: usize) -> Result<Vec<T>, StoreError> {
    tree.iter()
        .rev()
        .take(limit)
        .map(|entry| -> Result<T, StoreError> {
            let (_, value) = entry?;
            Ok(serde_json::from_slice(&value)?)
        })
        .collect()
}

#[async_trait]
impl ChatStore for SledStore {
    async fn save_message(
        &self,
        username: &str,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: self.db.generate_id()?,
            username: username.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.insert(&self.messages, stored.id, &stored)?;
        self.enforce_retention()?;
        Ok(stored)
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        newest(&self.messages, limit)
    }

    async fn save_activity(&self, username: &str, kind: ActivityKind) -> Result<(), StoreError> {
        let record = ActivityRecord {
            id: self.db.generate_id()?,
            username: username.to_string(),
            event_type: kind,
            timestamp: Utc::now(),
        };
        self.insert(&self.activity, record.id, &record)
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>, StoreError> {
        newest(&self.activity, limit)
    }
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("max_messages", &self.max_messages)
            .finish()
    }
}
