//! Prometheus metrics exposition
//!
//! - `relay_requests_total` (counter): labels `status`, `method`
//! - `relay_request_duration_seconds` (histogram): label `status`
//! - `relay_upstream_attempts_total` (counter): label `outcome`
//! - `relay_credential_deactivations_total` (counter): label `status`, emitted by the pool
//! - `relay_pool_refresh_total` (counter): label `result`, emitted by the pool cache

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bounds from 5ms to 60s, covering the configurable upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("relay_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed relay request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record one upstream endpoint attempt by outcome label.
pub fn record_upstream_attempt(outcome: &'static str) {
    metrics::counter!("relay_upstream_attempts_total", "outcome" => outcome).increment(1);
}
