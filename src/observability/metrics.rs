//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tcp_server_current_connections` (gauge): running connections
//! - `tcp_server_queued_connections` (gauge): connections waiting for a worker
//! - `tcp_server_busy_workers` / `tcp_server_idle_workers` (gauge)
//! - `tcp_server_admissions_total` (counter): by outcome (run, queue, reject)
//! - `tcp_server_handshakes_total` (counter): by kind (full, resumed, failed)
//! - `tls_session_cache_events_total` (counter): by cache and event
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Gauges are published from pool snapshots, never computed separately

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::pool::PoolStats;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Publish a pool snapshot as gauges.
pub fn record_pool_stats(stats: &PoolStats) {
    gauge!("tcp_server_current_connections").set(stats.current_connections as f64);
    gauge!("tcp_server_queued_connections").set(stats.queued_connections as f64);
    gauge!("tcp_server_busy_workers").set(stats.current_threads as f64);
    gauge!("tcp_server_idle_workers").set(stats.idle_threads as f64);
}

/// Count an admission decision.
pub fn record_admission(outcome: &'static str) {
    counter!("tcp_server_admissions_total", "outcome" => outcome).increment(1);
}

/// Count a finished server-side handshake.
pub fn record_handshake(kind: &'static str) {
    counter!("tcp_server_handshakes_total", "kind" => kind).increment(1);
}

/// Count a session cache event.
pub fn record_session_event(cache: &str, event: &'static str) {
    counter!(
        "tls_session_cache_events_total",
        "cache" => cache.to_string(),
        "event" => event
    )
    .increment(1);
}
