//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use huddle_core::{CloseReason, RegistryStats, SessionError, SessionStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
    pub const MESSAGES_BYTES: &str = "huddle_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const MEMBERS_ACTIVE: &str = "huddle_members_active";
    pub const ROOMS_CREATED_TOTAL: &str = "huddle_rooms_created_total";
    pub const SESSIONS_REJECTED_TOTAL: &str = "huddle_sessions_rejected_total";
    pub const SESSIONS_CLOSED_TOTAL: &str = "huddle_sessions_closed_total";
    pub const EVICTIONS_TOTAL: &str = "huddle_evictions_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one member");
    metrics::describe_gauge!(names::MEMBERS_ACTIVE, "Members across all rooms");
    metrics::describe_counter!(names::ROOMS_CREATED_TOTAL, "Rooms created in the directory");
    metrics::describe_counter!(
        names::SESSIONS_REJECTED_TOTAL,
        "Connections closed before joining a room"
    );
    metrics::describe_counter!(
        names::SESSIONS_CLOSED_TOTAL,
        "Sessions that left a room, by reason"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Members evicted after a refused delivery"
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record messages moving in one direction.
pub fn record_messages(count: u64, bytes: u64, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(count);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes);
}

/// Record a newly created room.
pub fn record_room_created() {
    counter!(names::ROOMS_CREATED_TOTAL).increment(1);
}

/// Record a session that never joined.
pub fn record_rejected(error: &SessionError) {
    let reason = match error {
        SessionError::RoomNotFound(_) => "room_not_found",
        SessionError::Directory(_) => "directory",
    };
    counter!(names::SESSIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record a session that left its room.
pub fn record_session_end(reason: &CloseReason, stats: &SessionStats) {
    counter!(names::SESSIONS_CLOSED_TOTAL, "reason" => reason.kind()).increment(1);
    record_messages(stats.received, stats.bytes_received, "inbound");
    record_messages(stats.sent, stats.bytes_sent, "outbound");
}

/// Publish registry gauges.
pub fn record_registry(stats: &RegistryStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.room_count as f64);
    gauge!(names::MEMBERS_ACTIVE).set(stats.member_count as f64);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evictions);
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
