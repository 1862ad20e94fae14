//! In-process loopback broker.
//!
//! Publications on a subscribed topic come straight back on the event
//! stream, which is exactly what a single hub sees from a real broker.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::traits::{Broker, BrokerError, BrokerEvent, QoS};

/// A broker that lives inside the current process.
#[derive(Debug)]
pub struct LocalBroker {
    subscriptions: DashSet<String>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    connected: AtomicBool,
}

impl LocalBroker {
    /// Create a connected loopback broker and its event stream.
    ///
    /// A [`BrokerEvent::Connected`] is already queued on the returned
    /// receiver.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(BrokerEvent::Connected);

        let broker = Self {
            subscriptions: DashSet::new(),
            events,
            connected: AtomicBool::new(true),
        };
        (broker, rx)
    }

    /// Simulate losing the connection. Subscriptions are dropped, as with a
    /// clean MQTT session.
    pub fn disconnect(&self, reason: impl Into<String>) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.subscriptions.clear();
            let _ = self.events.send(BrokerEvent::ConnectionLost(reason.into()));
        }
    }

    /// Simulate the connection coming back.
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(BrokerEvent::Connected);
        }
    }

    /// Check whether a topic currently has a subscription.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        self.subscriptions.insert(topic.to_string());
        debug!(topic = %topic, "Local broker subscription");
        Ok(())
    }

    async fn publish(&self, topic: &str, _qos: QoS, payload: Bytes) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }

        if !self.subscriptions.contains(topic) {
            trace!(topic = %topic, "No local subscribers, dropping publication");
            return Ok(());
        }

        self.events
            .send(BrokerEvent::Delivery {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| {
                warn!(topic = %topic, "Local broker event stream closed");
                BrokerError::Closed
            })
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
