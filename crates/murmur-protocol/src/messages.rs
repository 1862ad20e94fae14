//! Message types exchanged with the broker and with clients.
//!
//! Field names follow the established wire contract: chat messages use
//! `Username`/`Content`/`Timestamp`, presence events and client frames use
//! lower-case keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Online usernames at a point in time. Every value is `true`; absence
/// means offline.
pub type OnlineSet = BTreeMap<String, bool>;

/// A chat message as relayed through the broker and delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    /// Sender's username.
    #[serde(alias = "username")]
    pub username: String,
    /// Message text.
    #[serde(alias = "content")]
    pub content: String,
    /// When the message was sent. Receipt time if the publisher left it out.
    #[serde(alias = "timestamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped with the current instant.
    #[must_use]
    pub fn new(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_timestamp(username, content, Utc::now())
    }

    /// Create a message with an explicit timestamp.
    #[must_use]
    pub fn with_timestamp(
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }
}

/// A user going online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// The user whose presence changed.
    pub username: String,
    /// `true` when the user came online.
    pub online: bool,
}

impl PresenceEvent {
    /// An "online" event.
    #[must_use]
    pub fn online(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            online: true,
        }
    }

    /// An "offline" event.
    #[must_use]
    pub fn offline(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            online: false,
        }
    }
}

/// A chat frame sent by a client over its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientChat {
    /// Claimed sender. May be empty, in which case the connection's
    /// username is used.
    #[serde(default, alias = "Username")]
    pub username: String,
    /// Message text. A frame without one is relayed as an empty message.
    #[serde(default, alias = "Content")]
    pub content: String,
}

/// Events the hub pushes to clients besides plain chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full snapshot of who is online.
    UserStatus {
        #[serde(rename = "onlineUsers")]
        online_users: OnlineSet,
    },
}

impl ServerEvent {
    /// Wrap an online-set snapshot.
    #[must_use]
    pub fn user_status(online_users: OnlineSet) -> Self {
        ServerEvent::UserStatus { online_users }
    }
}

/// A broker delivery after decoding, tagged by what it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A chat message arrived on the chat topic.
    ChatReceived(ChatMessage),
    /// A presence event arrived on the status topic.
    PresenceReceived(PresenceEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_wire_keys() {
        let msg = ChatMessage::new("alice", "hi");
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["Username"], "alice");
        assert_eq!(value["Content"], "hi");
        assert!(value["Timestamp"].is_string());
    }

    #[test]
    fn test_chat_message_accepts_lowercase_keys() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "username": "bob",
            "content": "hello",
            "timestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(msg.username, "bob");
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_chat_message_missing_timestamp() {
        let before = Utc::now();
        let msg: ChatMessage =
            serde_json::from_value(json!({"Username": "bob", "Content": "yo"})).unwrap();
        assert!(msg.timestamp >= before);
    }

    #[test]
    fn test_presence_event_wire_keys() {
        let value = serde_json::to_value(PresenceEvent::online("carol")).unwrap();
        assert_eq!(value, json!({"username": "carol", "online": true}));
    }

    #[test]
    fn test_user_status_envelope() {
        let mut online = OnlineSet::new();
        online.insert("bob".to_string(), true);
        online.insert("carol".to_string(), true);

        let value = serde_json::to_value(ServerEvent::user_status(online)).unwrap();
        assert_eq!(
            value,
            json!({"type": "user_status", "onlineUsers": {"bob": true, "carol": true}})
        );
    }

    #[test]
    fn test_client_chat_without_username() {
        let chat: ClientChat = serde_json::from_str(r#"{"content":"hey"}"#).unwrap();
        assert!(chat.username.is_empty());
        assert_eq!(chat.content, "hey");
    }

    #[test]
    fn test_client_chat_is_lenient() {
        let chat: ClientChat =
            serde_json::from_str(r#"{"Username":"x","Content":"hi"}"#).unwrap();
        assert_eq!(chat.username, "x");
        assert_eq!(chat.content, "hi");

        let chat: ClientChat = serde_json::from_str(r#"{"username":"x"}"#).unwrap();
        assert_eq!(chat.username, "x");
        assert!(chat.content.is_empty());
    }
}
