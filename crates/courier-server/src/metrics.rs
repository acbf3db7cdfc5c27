//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use courier_protocol::MessageStatus;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const STATUS_TRANSITIONS_TOTAL: &str = "courier_status_transitions_total";
    pub const NOTIFICATIONS_TOTAL: &str = "courier_notifications_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "courier_frames_dropped_total";
    pub const LATENCY_SECONDS: &str = "courier_submit_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages persisted from chat connections");
    metrics::describe_counter!(
        names::STATUS_TRANSITIONS_TOTAL,
        "Message status transitions by target status"
    );
    metrics::describe_counter!(names::NOTIFICATIONS_TOTAL, "Notification payloads pushed");
    metrics::describe_counter!(
        names::FRAMES_DROPPED_TOTAL,
        "Inbound frames dropped as malformed or duplicate"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Time from frame receipt to fan-out in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a persisted message and the status it settled in.
pub fn record_message(status: MessageStatus) {
    counter!(names::MESSAGES_TOTAL).increment(1);
    if status != MessageStatus::Sent {
        record_transitions(status, 1);
    }
}

/// Record status transitions.
pub fn record_transitions(status: MessageStatus, count: usize) {
    counter!(names::STATUS_TRANSITIONS_TOTAL, "status" => status.as_str()).increment(count as u64);
}

/// Record a pushed notification.
pub fn record_notification(kind: &'static str) {
    counter!(names::NOTIFICATIONS_TOTAL, "kind" => kind).increment(1);
}

/// Record a dropped inbound frame.
pub fn record_dropped_frame(reason: &'static str) {
    counter!(names::FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record submit latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    endpoint: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(endpoint: &'static str) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "endpoint" => endpoint).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => endpoint).increment(1.0);
        Self { endpoint }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => self.endpoint).decrement(1.0);
    }
}
