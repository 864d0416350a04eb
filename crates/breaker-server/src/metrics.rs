//! Metrics collection and export for Breaker.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use breaker_core::{HubError, HubStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "breaker_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "breaker_connections_active";
    pub const CLIENTS_REGISTERED: &str = "breaker_clients_registered";
    pub const BROADCASTS_TOTAL: &str = "breaker_broadcasts_total";
    pub const DELIVERIES_TOTAL: &str = "breaker_deliveries_total";
    pub const DROPPED_TOTAL: &str = "breaker_dropped_total";
    pub const FAULTS_TOTAL: &str = "breaker_faults_total";
    pub const PUBLISHED_BYTES: &str = "breaker_published_bytes";
    pub const ERRORS_TOTAL: &str = "breaker_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of websocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open websocket connections"
    );
    metrics::describe_gauge!(
        names::CLIENTS_REGISTERED,
        "Clients currently registered with the hub"
    );
    metrics::describe_gauge!(names::BROADCASTS_TOTAL, "Broadcasts fanned out by the hub");
    metrics::describe_gauge!(
        names::DELIVERIES_TOTAL,
        "Messages placed on client outbound queues"
    );
    metrics::describe_gauge!(
        names::DROPPED_TOTAL,
        "Deliveries skipped because a client queue was full"
    );
    metrics::describe_gauge!(names::FAULTS_TOTAL, "Faults recovered by the hub event loop");
    metrics::describe_counter!(
        names::PUBLISHED_BYTES,
        "Bytes accepted on the HTTP broadcast endpoint"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors reported by the hub");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Metrics server listening");
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

/// Record a payload accepted on the broadcast endpoint.
pub fn record_published(bytes: usize) {
    counter!(names::PUBLISHED_BYTES).increment(bytes as u64);
}

/// Short label for an error reported by the hub.
#[must_use]
pub fn error_kind(err: &HubError) -> &'static str {
    match err {
        HubError::InvalidArgument(_) => "invalid_argument",
        HubError::InvalidConfig(_) => "invalid_config",
        HubError::Closed => "closed",
        HubError::Transport { .. } => "transport",
        HubError::Fault { .. } => "fault",
    }
}

/// Record an error reported by the hub.
pub fn record_error(err: &HubError) {
    counter!(names::ERRORS_TOTAL, "type" => error_kind(err)).increment(1);
}

/// Publish a hub statistics snapshot.
///
/// The hub's counters are cumulative, so they are exported as gauges set to
/// the latest value.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::CLIENTS_REGISTERED).set(stats.clients as f64);
    gauge!(names::BROADCASTS_TOTAL).set(stats.broadcasts as f64);
    gauge!(names::DELIVERIES_TOTAL).set(stats.delivered as f64);
    gauge!(names::DROPPED_TOTAL).set(stats.dropped as f64);
    gauge!(names::FAULTS_TOTAL).set(stats.faults as f64);
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
