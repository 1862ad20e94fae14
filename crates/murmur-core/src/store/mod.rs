//! Chat history and activity persistence.
//!
//! The hub only needs four operations from storage, captured by the
//! [`ChatStore`] trait. Two backends are provided:
//!
//! - [`MemoryStore`] - bounded ring buffers, lost on restart
//! - [`SledStore`] - durable, backed by a `sled` database

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_protocol::ChatMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The sled database failed.
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// A record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A chat message as stored, with its assigned ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<StoredMessage> for ChatMessage {
    fn from(stored: StoredMessage) -> Self {
        ChatMessage::with_timestamp(stored.username, stored.content, stored.timestamp)
    }
}

/// Kind of activity recorded for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Online,
    Offline,
}

impl ActivityKind {
    /// Activity kind matching a presence flag.
    #[must_use]
    pub fn from_online(online: bool) -> Self {
        if online {
            ActivityKind::Online
        } else {
            ActivityKind::Offline
        }
    }

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Online => "online",
            ActivityKind::Offline => "offline",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded presence change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: u64,
    pub username: String,
    pub event_type: ActivityKind,
    pub timestamp: DateTime<Utc>,
}

/// Persistence used by the hub.
///
/// Listing operations return the newest records first.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Store a chat message.
    async fn save_message(&self, username: &str, content: &str)
        -> Result<StoredMessage, StoreError>;

    /// The `limit` most recent messages, newest first.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// Record a user going online or offline.
    async fn save_activity(&self, username: &str, kind: ActivityKind) -> Result<(), StoreError>;

    /// The `limit` most recent activity records, newest first.
    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_message_wire_keys() {
        let stored = StoredMessage {
            id: 7,
            username: "alice".to_string(),
            content: "hi".to_string(),
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
        };
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["ID"], 7);
        assert_eq!(value["Username"], "alice");

        let chat = ChatMessage::from(stored);
        assert_eq!(chat.content, "hi");
    }

    #[test]
    fn test_activity_record_wire_keys() {
        let record = ActivityRecord {
            id: 1,
            username: "bob".to_string(),
            event_type: ActivityKind::Offline,
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "id": 1,
                "username": "bob",
                "eventType": "offline",
                "timestamp": "2024-05-01T12:00:00Z"
            })
        );
    }
}
