//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `token_pool_active` / `token_pool_inactive` (gauges)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use token_pool::PoolStats;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )?)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// `proxy_request_duration_seconds` gets explicit buckets (5ms to 60s) so it
/// renders as a histogram rather than a summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a failed upstream attempt with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Publish the pool's active/inactive split.
pub fn record_pool(stats: &PoolStats) {
    metrics::gauge!("token_pool_active").set(stats.active_tokens as f64);
    metrics::gauge!("token_pool_inactive").set(stats.inactive_tokens as f64);
}
