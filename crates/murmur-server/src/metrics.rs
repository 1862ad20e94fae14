//! Metrics collection and export for Murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::HubStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "murmur_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "murmur_messages_total";
    pub const MESSAGES_BYTES: &str = "murmur_messages_bytes";
    pub const USERS_ONLINE: &str = "murmur_users_online";
    pub const DELIVERIES_TOTAL: &str = "murmur_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "murmur_evictions_total";
    pub const DROPPED_TOTAL: &str = "murmur_dispatch_dropped_total";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of client frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of client frames processed");
    metrics::describe_gauge!(names::USERS_ONLINE, "Current number of online users");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Payloads queued for individual clients"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Clients dropped because they could not keep up"
    );
    metrics::describe_counter!(
        names::DROPPED_TOTAL,
        "Payloads dropped because the dispatch queue was full"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused connection.
pub fn record_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a client frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update the online user count.
pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

/// Publish the hub's cumulative counters.
pub fn record_hub_stats(stats: HubStats) {
    counter!(names::DELIVERIES_TOTAL).absolute(stats.delivered);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evicted);
    counter!(names::DROPPED_TOTAL).absolute(stats.dropped);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
