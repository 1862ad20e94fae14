//! Broker abstraction traits.
//!
//! These traits define the interface every broker implementation provides,
//! so the hub never depends on a particular broker client.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Delivery guarantee requested for a subscription or publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce,
    /// Acknowledged delivery without duplicates.
    ExactlyOnce,
}

/// Something that happened on the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The connection was (re)established. Subscriptions must be renewed.
    Connected,
    /// A publication arrived on a subscribed topic.
    Delivery {
        /// Topic the payload was published to.
        topic: String,
        /// Raw payload.
        payload: Bytes,
    },
    /// The connection dropped. The client reconnects on its own.
    ConnectionLost(String),
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection is down.
    #[error("Broker not connected")]
    NotConnected,

    /// The broker client has shut down.
    #[error("Broker client closed")]
    Closed,

    /// Subscribing failed.
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    /// Publishing failed.
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// A publish/subscribe broker connection.
///
/// Inbound deliveries are not part of this trait: each implementation hands
/// out an event receiver when it is created.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BrokerError>;

    /// Get the broker name (e.g., "mqtt", "local").
    fn name(&self) -> &'static str;

    /// Check if the broker connection is currently up.
    fn is_connected(&self) -> bool {
        true
    }
}
