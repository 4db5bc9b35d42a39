//! Prometheus metrics for the control plane process.
//!
//! These describe the health of this process (sessions, broker traffic,
//! flush cycles). Per-tenant billing counters are a separate concern and live
//! in [`crate::usage`].

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_cp";

lazy_static! {
    // ============================================================================
    // Session Metrics
    // ============================================================================

    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_sessions_active", METRIC_PREFIX),
        "Number of live dashboard sessions"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket sessions accepted"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket sessions closed"
    ).unwrap();

    pub static ref WS_HANDSHAKES_REJECTED: IntCounter = register_int_counter!(
        format!("{}_ws_handshakes_rejected_total", METRIC_PREFIX),
        "Handshakes closed for missing or invalid identity"
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket session duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Bridge Metrics
    // ============================================================================

    pub static ref BROKER_SUBSCRIPTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_broker_subscriptions_active", METRIC_PREFIX),
        "Broker subscriptions held for dashboard topics"
    ).unwrap();

    pub static ref BROKER_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_broker_messages_received_total", METRIC_PREFIX),
        "Messages received from the broker"
    ).unwrap();

    pub static ref BROKER_MESSAGES_REJECTED: IntCounter = register_int_counter!(
        format!("{}_broker_messages_rejected_total", METRIC_PREFIX),
        "Broker messages dropped because they could not be decoded"
    ).unwrap();

    pub static ref SUBSCRIPTIONS_DENIED: IntCounter = register_int_counter!(
        format!("{}_subscriptions_denied_total", METRIC_PREFIX),
        "Topic subscriptions rejected by tenant authorization"
    ).unwrap();

    pub static ref EVENTS_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_delivered_total", METRIC_PREFIX),
        "Messages queued to dashboard sessions"
    ).unwrap();

    pub static ref EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_dropped_total", METRIC_PREFIX),
        "Messages dropped because a session queue was full"
    ).unwrap();

    // ============================================================================
    // Usage Pipeline Metrics
    // ============================================================================

    pub static ref AGGREGATOR_CYCLES: IntCounter = register_int_counter!(
        format!("{}_aggregator_cycles_total", METRIC_PREFIX),
        "Completed usage collection cycles"
    ).unwrap();

    pub static ref FLUSH_CYCLES: IntCounter = register_int_counter!(
        format!("{}_flush_cycles_total", METRIC_PREFIX),
        "Completed usage flush cycles"
    ).unwrap();

    pub static ref FLUSH_RECORDS_WRITTEN: IntCounter = register_int_counter!(
        format!("{}_flush_records_written_total", METRIC_PREFIX),
        "Daily usage records upserted"
    ).unwrap();

    pub static ref FLUSH_FAILURES: IntCounter = register_int_counter!(
        format!("{}_flush_failures_total", METRIC_PREFIX),
        "Daily usage record upserts that failed and will be retried"
    ).unwrap();

    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        format!("{}_flush_duration_seconds", METRIC_PREFIX),
        "Time spent in one flush cycle",
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
