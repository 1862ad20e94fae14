//! Broker topic names.

use serde::{Deserialize, Serialize};

/// Default topic for chat messages.
pub const CHAT_TOPIC: &str = "chat/messages";

/// Default topic for presence events.
pub const STATUS_TOPIC: &str = "chat/status";

/// The pair of topics the hub publishes to and subscribes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    /// Topic carrying [`ChatMessage`](crate::ChatMessage) payloads.
    #[serde(default = "default_chat")]
    pub chat: String,
    /// Topic carrying [`PresenceEvent`](crate::PresenceEvent) payloads.
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_chat() -> String {
    CHAT_TOPIC.to_string()
}

fn default_status() -> String {
    STATUS_TOPIC.to_string()
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            chat: default_chat(),
            status: default_status(),
        }
    }
}

impl Topics {
    /// Both topics, in subscription order.
    #[must_use]
    pub fn all(&self) -> [&str; 2] {
        [&self.chat, &self.status]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topics() {
        let topics = Topics::default();
        assert_eq!(topics.all(), ["chat/messages", "chat/status"]);
    }
}
