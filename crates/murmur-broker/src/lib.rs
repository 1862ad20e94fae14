//! # murmur-broker
//!
//! Broker abstraction layer for the Murmur chat hub.
//!
//! The hub relays chat and presence traffic through an external
//! publish/subscribe broker so several processes can share one room:
//!
//! - **MQTT** - the production broker, via `rumqttc`
//! - **Local** - an in-process loopback for single-node runs and tests
//!
//! ## Broker Abstraction
//!
//! Every broker implements the [`Broker`] trait for the outbound direction
//! and is created together with a stream of [`BrokerEvent`]s for the
//! inbound direction.
//!
//! ```rust,ignore
//! use murmur_broker::{Broker, BrokerEvent, LocalBroker, QoS};
//!
//! let (broker, mut events) = LocalBroker::new();
//! broker.subscribe("chat/messages", QoS::AtLeastOnce).await?;
//! while let Some(event) = events.recv().await {
//!     // Route event
//! }
//! ```

pub mod local;
pub mod traits;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use local::LocalBroker;
pub use traits::{Broker, BrokerError, BrokerEvent, QoS};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBroker, MqttConfig};
