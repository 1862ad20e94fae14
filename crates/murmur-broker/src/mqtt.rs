//! MQTT broker implementation.
//!
//! This module connects to an MQTT broker using rumqttc. The client's event
//! loop runs on its own task and is translated into [`BrokerEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::traits::{Broker, BrokerError, BrokerEvent, QoS};

/// MQTT connection configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Pause between polls after a connection error.
    pub reconnect_delay: Duration,
    /// Capacity of the client request queue.
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "murmur-hub".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            request_capacity: 64,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// An MQTT broker connection.
pub struct MqttBroker {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttBroker {
    /// Start connecting to the broker.
    ///
    /// The connection is established in the background; a
    /// [`BrokerEvent::Connected`] arrives on the returned receiver once the
    /// broker accepts it, and again after every reconnect.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(config: MqttConfig) -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let (events, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );

        tokio::spawn(drive_event_loop(
            eventloop,
            events,
            Arc::clone(&connected),
            config.reconnect_delay,
        ));

        (Self { client, connected }, rx)
    }
}

/// Poll the rumqttc event loop until the event receiver goes away.
///
/// Polling again after an error is what makes rumqttc reconnect.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    connected: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected.store(true, Ordering::SeqCst);
                info!(code = ?ack.code, "Connected to MQTT broker");
                BrokerEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT delivery");
                BrokerEvent::Delivery {
                    topic: publish.topic,
                    payload: publish.payload,
                }
            }
            Ok(_) => continue,
            Err(e) => {
                let was_connected = connected.swap(false, Ordering::SeqCst);
                tokio::time::sleep(reconnect_delay).await;
                if !was_connected {
                    warn!(error = %e, "MQTT broker unreachable");
                    continue;
                }
                BrokerEvent::ConnectionLost(e.to_string())
            }
        };

        if events.send(event).is_err() {
            debug!("Broker event receiver dropped, stopping MQTT event loop");
            break;
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| BrokerError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        self.client
            .publish(topic, qos.into(), false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
