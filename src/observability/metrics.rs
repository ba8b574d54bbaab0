//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define balancer metrics
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `balancer_requests_total` (counter): finished forwards by outcome
//! - `balancer_rescheduled_total` (counter): requests redispatched after a dial failure
//! - `balancer_rejected_total` (counter): requests dropped at the per-backend ceiling
//! - `balancer_tunnel_sessions_total` (counter): tunnel session events
//! - `balancer_bytes_total` (counter): spliced bytes by direction
//! - `balancer_backends` (gauge): backends tracked by the scheduler
//! - `balancer_pool_size` (gauge): backends currently schedulable
//! - `balancer_pending` (gauge): requests waiting for a backend
//! - `balancer_backend_ongoing` (gauge): in-flight forwards per backend

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Outcome label of a finished forward.
pub fn record_request(outcome: &'static str) {
    counter!("balancer_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_rescheduled() {
    counter!("balancer_rescheduled_total").increment(1);
}

pub fn record_rejected() {
    counter!("balancer_rejected_total").increment(1);
}

/// `event` is one of `established`, `failed`, `evicted`, `replaced`.
pub fn record_session(event: &'static str) {
    counter!("balancer_tunnel_sessions_total", "event" => event).increment(1);
}

pub fn record_bytes(rx: u64, tx: u64) {
    counter!("balancer_bytes_total", "direction" => "rx").increment(rx);
    counter!("balancer_bytes_total", "direction" => "tx").increment(tx);
}

pub fn record_scheduler_state(backends: usize, pool_size: usize, pending: usize) {
    gauge!("balancer_backends").set(backends as f64);
    gauge!("balancer_pool_size").set(pool_size as f64);
    gauge!("balancer_pending").set(pending as f64);
}

pub fn record_backend_ongoing(backend: &str, ongoing: usize) {
    gauge!("balancer_backend_ongoing", "backend" => backend.to_string()).set(ongoing as f64);
}
