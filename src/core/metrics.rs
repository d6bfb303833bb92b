// src/core/metrics.rs

//! Defines and registers Prometheus metrics for bridge monitoring.
//!
//! Metrics are registered once, globally, through `lazy_static`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of client sessions currently alive.
    pub static ref CONNECTED_SESSIONS: Gauge =
        register_gauge!("topicbridge_connected_sessions", "Number of live client sessions.").unwrap();

    // --- Counters ---
    /// Connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("topicbridge_connections_received_total", "Total number of connections accepted.").unwrap();
    /// Connections closed before a session was created (limit reached, failed handshake, backbone down).
    pub static ref CONNECTIONS_REJECTED_TOTAL: CounterVec =
        register_counter_vec!("topicbridge_connections_rejected_total", "Connections closed before a session started, by reason.", &["reason"]).unwrap();
    /// Client frames received, accepted or not.
    pub static ref FRAMES_RECEIVED_TOTAL: Counter =
        register_counter!("topicbridge_frames_received_total", "Total number of client frames received.").unwrap();
    /// Client frames dropped, labeled by error kind.
    pub static ref FRAMES_REJECTED_TOTAL: CounterVec =
        register_counter_vec!("topicbridge_frames_rejected_total", "Client frames dropped, by error kind.", &["kind"]).unwrap();
    /// Envelopes handed to the backbone.
    pub static ref ENVELOPES_PUBLISHED_TOTAL: Counter =
        register_counter!("topicbridge_envelopes_published_total", "Total number of envelopes published to the backbone.").unwrap();
    /// Backbone messages forwarded to clients.
    pub static ref DELIVERIES_TOTAL: Counter =
        register_counter!("topicbridge_deliveries_total", "Total number of backbone messages delivered to clients.").unwrap();
    /// Backbone messages a slow session missed.
    pub static ref DELIVERIES_LAGGED_TOTAL: Counter =
        register_counter!("topicbridge_deliveries_lagged_total", "Backbone messages skipped because a session lagged behind.").unwrap();
    /// Failures releasing a session's backbone adapter.
    pub static ref TEARDOWN_ERRORS_TOTAL: Counter =
        register_counter!("topicbridge_teardown_errors_total", "Failures while releasing backbone adapters.").unwrap();

    // --- Histograms ---
    /// Time spent dispatching one client frame, backbone round trip included.
    pub static ref DISPATCH_LATENCY_SECONDS: Histogram =
        register_histogram!("topicbridge_dispatch_latency_seconds", "Latency of client frame dispatch in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
