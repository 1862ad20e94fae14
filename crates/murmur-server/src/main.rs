//! # Murmur Server
//!
//! Presence-aware chat hub: relays chat and presence between an MQTT broker
//! and WebSocket clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Single node, no external broker, durable history
//! MURMUR_BROKER__KIND=local MURMUR_STORE__KIND=sled murmur
//!
//! # Run with environment variables
//! MURMUR_PORT=8080 MURMUR_BROKER__HOST=mqtt.internal murmur
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use crate::config::{BrokerConfig, BrokerKind, Config, StoreConfig, StoreKind};
use murmur_broker::{Broker, BrokerEvent, LocalBroker};
use murmur_core::{ChatStore, MemoryStore, SledStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    info!("Starting Murmur server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let store = open_store(&config.store)?;
    let (broker, events) = connect_broker(&config.broker)?;

    let state = Arc::new(handlers::AppState::new(config, broker, store));
    Arc::clone(&state.bridge).spawn(events);

    // Start the server
    handlers::run_server(state).await?;

    Ok(())
}

fn open_store(config: &StoreConfig) -> Result<Arc<dyn ChatStore>> {
    match config.kind {
        StoreKind::Memory => {
            let store = match config.max_messages {
                Some(max) => MemoryStore::with_capacity(max),
                None => MemoryStore::new(),
            };
            info!("Using in-memory store");
            Ok(Arc::new(store))
        }
        StoreKind::Sled => {
            let store = SledStore::open(&config.path, config.max_messages).with_context(|| {
                format!("Failed to open sled store at {}", config.path.display())
            })?;
            info!(path = %config.path.display(), "Using sled store");
            Ok(Arc::new(store))
        }
    }
}

type BrokerParts = (Arc<dyn Broker>, mpsc::UnboundedReceiver<BrokerEvent>);

fn connect_broker(config: &BrokerConfig) -> Result<BrokerParts> {
    match config.kind {
        BrokerKind::Local => {
            let (broker, events) = LocalBroker::new();
            info!("Using in-process broker");
            let broker: Arc<dyn Broker> = Arc::new(broker);
            Ok((broker, events))
        }
        #[cfg(feature = "mqtt")]
        BrokerKind::Mqtt => {
            let mqtt = murmur_broker::MqttConfig {
                host: config.host.clone(),
                port: config.port,
                client_id: config.client_id.clone(),
                keep_alive: config.keep_alive(),
                ..murmur_broker::MqttConfig::default()
            };
            let (broker, events) = murmur_broker::MqttBroker::connect(mqtt);
            info!(host = %config.host, port = config.port, "Using MQTT broker");
            let broker: Arc<dyn Broker> = Arc::new(broker);
            Ok((broker, events))
        }
        #[cfg(not(feature = "mqtt"))]
        BrokerKind::Mqtt => {
            anyhow::bail!("MQTT support not compiled in; set broker.kind = \"local\"")
        }
    }
}
