//! Bridge between the external broker and the local hub.
//!
//! Inbound, broker deliveries are decoded into [`InboundEvent`]s and routed
//! to the hub and the presence tracker. Outbound, locally originated chat
//! and presence events are published to the broker. Every failure is logged
//! and dropped; nothing is retried.

use bytes::Bytes;
use murmur_broker::{Broker, BrokerEvent, QoS};
use murmur_protocol::{
    codec, ChatMessage, InboundEvent, OnlineSet, PresenceEvent, ServerEvent, Topics,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hub::BroadcastHub;
use crate::presence::{PresenceTracker, PresenceUpdate};
use crate::store::{ActivityKind, ChatStore};

/// QoS used for every subscription and publication.
const RELAY_QOS: QoS = QoS::AtLeastOnce;

/// Connects a [`Broker`] to the local hub.
pub struct MessageBridge {
    broker: Arc<dyn Broker>,
    hub: BroadcastHub,
    presence: Arc<PresenceTracker>,
    store: Arc<dyn ChatStore>,
    topics: Topics,
}

impl MessageBridge {
    /// Create a bridge.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        hub: BroadcastHub,
        presence: Arc<PresenceTracker>,
        store: Arc<dyn ChatStore>,
        topics: Topics,
    ) -> Self {
        Self {
            broker,
            hub,
            presence,
            store,
            topics,
        }
    }

    /// Consume broker events on a background task.
    pub fn spawn(self: Arc<Self>, events: mpsc::UnboundedReceiver<BrokerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }

    /// Consume broker events until the broker's event stream ends.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_broker_event(event).await;
        }
        info!(broker = self.broker.name(), "Broker event stream ended");
    }

    /// Handle one broker event.
    pub async fn handle_broker_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => self.subscribe_topics().await,
            BrokerEvent::Delivery { topic, payload } => {
                debug!(topic = %topic, bytes = payload.len(), "Broker delivery");
                match codec::decode_inbound(&self.topics, &topic, &payload) {
                    Ok(event) => self.dispatch(event).await,
                    Err(e) => warn!(topic = %topic, error = %e, "Discarding broker payload"),
                }
            }
            BrokerEvent::ConnectionLost(reason) => {
                warn!(broker = self.broker.name(), reason = %reason, "Broker connection lost");
            }
        }
    }

    async fn subscribe_topics(&self) {
        for topic in self.topics.all() {
            match self.broker.subscribe(topic, RELAY_QOS).await {
                Ok(()) => info!(topic = %topic, "Subscribed to topic"),
                Err(e) => error!(topic = %topic, error = %e, "Subscribe failed"),
            }
        }
    }

    /// Route a decoded inbound event.
    pub async fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::ChatReceived(message) => self.relay_chat(message).await,
            InboundEvent::PresenceReceived(event) => {
                self.apply_presence(event).await;
            }
        }
    }

    /// Persist a chat message and broadcast it to local clients.
    ///
    /// The broadcast happens even when persistence fails.
    async fn relay_chat(&self, message: ChatMessage) {
        if let Err(e) = self.store.save_message(&message.username, &message.content).await {
            error!(username = %message.username, error = %e, "Failed to persist message");
        }

        match codec::encode(&message) {
            Ok(payload) => self.hub.broadcast(payload),
            Err(e) => error!(error = %e, "Failed to encode chat message"),
        }
    }

    /// Apply a presence change locally: update the tracker, record the
    /// activity and broadcast the new online set.
    pub async fn apply_presence(&self, event: PresenceEvent) -> PresenceUpdate {
        let update = self.presence.apply(&event);
        info!(
            username = %event.username,
            online = event.online,
            changed = update.changed,
            "Presence update"
        );

        let kind = ActivityKind::from_online(event.online);
        if let Err(e) = self.store.save_activity(&event.username, kind).await {
            error!(username = %event.username, error = %e, "Failed to record activity");
        }

        self.broadcast_presence(&update.snapshot);
        update
    }

    /// Broadcast an online-set snapshot to local clients.
    pub fn broadcast_presence(&self, snapshot: &OnlineSet) {
        match codec::encode(&ServerEvent::user_status(snapshot.clone())) {
            Ok(payload) => self.hub.broadcast(payload),
            Err(e) => error!(error = %e, "Failed to encode presence snapshot"),
        }
    }

    /// Publish a chat message sent by a local client.
    pub async fn publish_chat(&self, username: &str, content: &str) {
        let message = ChatMessage::new(username, content);
        match codec::encode(&message) {
            Ok(payload) => {
                debug!(username = %username, "Publishing chat message");
                self.publish(&self.topics.chat, payload).await;
            }
            Err(e) => error!(error = %e, "Failed to encode chat message"),
        }
    }

    /// Publish a local presence change.
    pub async fn publish_presence(&self, event: &PresenceEvent) {
        match codec::encode(event) {
            Ok(payload) => self.publish(&self.topics.status, payload).await,
            Err(e) => error!(error = %e, "Failed to encode presence event"),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) {
        if let Err(e) = self.broker.publish(topic, RELAY_QOS, payload).await {
            error!(topic = %topic, broker = self.broker.name(), error = %e, "Publish failed");
        }
    }

    /// The topics this bridge relays.
    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}
