//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Log server connections and event streaming
//! - Remote client connection attempts and reconnects
//! - Partitioned dispatch (critical drains, control markers, discards)
//! - Merge queue depth
//! - Commit position updates
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `distributor_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_distributor::metrics;
//! use std::time::Duration;
//!
//! // In the server handler after a window is sent
//! metrics::record_events_sent("db1", 42);
//!
//! // In the dispatcher after a critical barrier
//! metrics::record_critical_drain(Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Log Server Metrics
// =============================================================================

/// Record an accepted (or failed) inbound connection.
pub fn record_server_connection(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("distributor_server_connections_total", "status" => status).increment(1);
}

/// Gauge for live protocol handlers.
pub fn set_active_handlers(count: usize) {
    gauge!("distributor_server_active_handlers").set(count as f64);
}

/// Record events written to a remote reader.
pub fn record_events_sent(client_id: &str, count: usize) {
    counter!("distributor_events_sent_total", "client_id" => client_id.to_string())
        .increment(count as u64);
}

/// Record a heartbeat frame sent on an idle connection.
pub fn record_heartbeat_sent() {
    counter!("distributor_heartbeats_sent_total").increment(1);
}

/// Record a handshake rejected by the validator.
pub fn record_handshake_rejected(reason: &str) {
    counter!("distributor_handshake_rejections_total", "reason" => reason.to_string())
        .increment(1);
}

/// Record a handler that did not finish within the stop timeout.
pub fn record_handler_abandoned() {
    counter!("distributor_server_handlers_abandoned_total").increment(1);
}

// =============================================================================
// Remote Client Metrics
// =============================================================================

/// Record a connection attempt outcome (`success`, `timeout`, `io_error`,
/// `role_mismatch`).
pub fn record_connect_attempt(uri: &str, outcome: &str) {
    counter!(
        "distributor_client_connect_attempts_total",
        "uri" => uri.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a reconnect after a read failure.
pub fn record_client_reconnect(uri: &str) {
    counter!("distributor_client_reconnects_total", "uri" => uri.to_string()).increment(1);
}

/// Record events received from the server.
pub fn record_events_received(count: usize) {
    counter!("distributor_client_events_received_total").increment(count as u64);
}

/// Record a synthesized filtered-range marker after a resume gap.
pub fn record_resume_gap(skipped: u64) {
    counter!("distributor_client_resume_gaps_total").increment(1);
    histogram!("distributor_client_resume_gap_size").record(skipped as f64);
}

/// Gauge for client connection state.
pub fn set_client_state(state: &str) {
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Connected" => 2.0,
        "Reconnecting" => 3.0,
        "ShuttingDown" => 4.0,
        _ => -1.0,
    };
    gauge!("distributor_client_state").set(value);
}

// =============================================================================
// Dispatch Metrics
// =============================================================================

/// Record an event routed to a partition.
pub fn record_dispatched(partition: usize) {
    counter!("distributor_dispatch_events_total", "partition" => partition.to_string())
        .increment(1);
}

/// Record an empty event discarded by the dispatcher.
pub fn record_discarded() {
    counter!("distributor_dispatch_discarded_total").increment(1);
}

/// Record a drain-to-zero barrier and how long it blocked.
pub fn record_critical_drain(waited: Duration) {
    counter!("distributor_dispatch_critical_drains_total").increment(1);
    histogram!("distributor_dispatch_critical_drain_seconds").record(waited.as_secs_f64());
}

/// Record a control marker emitted (`sync`, `stop`, `filtered_range`).
pub fn record_control_marker(kind: &str) {
    counter!("distributor_control_markers_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for events accepted but not yet taken by a consumer.
pub fn set_in_flight(count: usize) {
    gauge!("distributor_dispatch_in_flight").set(count as f64);
}

/// Gauge for a merge queue's output depth.
pub fn set_merge_queue_depth(partition: usize, depth: usize) {
    gauge!("distributor_merge_queue_depth", "partition" => partition.to_string())
        .set(depth as f64);
}

// =============================================================================
// Commit Position Metrics
// =============================================================================

/// Record a persisted commit position update.
pub fn record_commit_update(channel: u32, latency_secs: f64) {
    counter!("distributor_commit_updates_total", "channel" => channel.to_string()).increment(1);
    gauge!("distributor_commit_applied_latency_seconds", "channel" => channel.to_string())
        .set(latency_secs);
}

/// Record an update dropped because it would move the position backward.
pub fn record_commit_regression(channel: u32) {
    counter!("distributor_commit_regressions_dropped_total", "channel" => channel.to_string())
        .increment(1);
}

/// Record a commit store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn commit_retries_total(operation: &str) {
    counter!("distributor_commit_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "distributor_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
