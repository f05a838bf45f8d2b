//! Prometheus metrics exposition
//!
//! - `gate_requests_total` (counter): labels `status`, `method`
//! - `gate_request_duration_seconds` (histogram): label `status`
//! - `gate_upstream_errors_total` (counter): label `error_type`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering.
///
/// The handle's `render()` output is the text exposition format served on
/// `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxied request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("gate_requests_total", "status" => status.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("gate_request_duration_seconds", "status" => status).record(duration_secs);
}

/// Record a failure on the upstream or token path.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gate_upstream_errors_total", "error_type" => error_type).increment(1);
}
