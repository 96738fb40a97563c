//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define listener and rule metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `tcp_listeners_bound_total` (counter): successful binds by protocol
//! - `tcp_listener_bind_failures_total` (counter): failed binds by protocol, severity
//! - `tcp_content_verdicts_total` (counter): rule outcomes by frontend, verdict
//! - `tcp_sessions_active` (gauge): sessions currently tracked
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   `--check` runs need no setup

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::diagnostic::ErrCode;
use crate::rules::Verdict;

/// Install the Prometheus recorder and its HTTP listener.
/// Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "failed to install metrics exporter"),
    }
}

pub fn record_listener_bound(protocol: &'static str) {
    metrics::counter!("tcp_listeners_bound_total", "protocol" => protocol).increment(1);
}

pub fn record_bind_failure(protocol: &'static str, code: ErrCode) {
    let severity = if code.is_fatal() { "fatal" } else { "retryable" };
    metrics::counter!(
        "tcp_listener_bind_failures_total",
        "protocol" => protocol,
        "severity" => severity
    )
    .increment(1);
}

pub fn record_tcp_verdict(frontend: &str, verdict: Verdict) {
    metrics::counter!(
        "tcp_content_verdicts_total",
        "frontend" => frontend.to_string(),
        "verdict" => verdict.as_str()
    )
    .increment(1);
}

pub fn record_active_sessions(active: u64) {
    metrics::gauge!("tcp_sessions_active").set(active as f64);
}
