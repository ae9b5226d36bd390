//! Prometheus Metrics Definitions
//!
//! Call lifecycle, correlation, extraction and sweeper counters, exposed on
//! `GET /metrics` for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<ApiResult<CallctxMetrics>> = Lazy::new(CallctxMetrics::new);

/// The registered metrics, or `None` if registration failed at startup.
pub fn metrics() -> Option<&'static CallctxMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all callctx metrics.
#[derive(Clone)]
pub struct CallctxMetrics {
    /// labels: method, path, status
    pub http_requests_total: CounterVec,

    /// labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// labels: identification (identified/unidentified)
    pub calls_started_total: CounterVec,

    /// labels: stage (create/attach)
    pub calls_degraded_total: CounterVec,

    /// labels: event (created/destroyed)
    pub snippets_total: CounterVec,

    /// labels: source (coordinator/sweeper)
    pub teardown_failures_total: CounterVec,

    /// labels: outcome (call_id_hint/exact/fallback/ambiguous/miss)
    pub correlation_total: CounterVec,

    /// labels: outcome (success/failure/skipped)
    pub extraction_total: CounterVec,

    /// labels: action (destroyed/retired/retried/error)
    pub sweeper_actions_total: CounterVec,

    pub sweeper_cycles_total: Counter,
}

fn register_failed(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

impl CallctxMetrics {
    /// Create and register all metrics with the default registry.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "callctx_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| register_failed("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "callctx_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| register_failed("http_request_duration_seconds", e))?,

            calls_started_total: register_counter_vec!(
                "callctx_calls_started_total",
                "Inbound calls accepted",
                &["identification"]
            )
            .map_err(|e| register_failed("calls_started_total", e))?,

            calls_degraded_total: register_counter_vec!(
                "callctx_calls_degraded_total",
                "Calls proceeding without personalized context",
                &["stage"]
            )
            .map_err(|e| register_failed("calls_degraded_total", e))?,

            snippets_total: register_counter_vec!(
                "callctx_snippets_total",
                "Knowledge snippet lifecycle events",
                &["event"]
            )
            .map_err(|e| register_failed("snippets_total", e))?,

            teardown_failures_total: register_counter_vec!(
                "callctx_teardown_failures_total",
                "Snippet detach/destroy attempts that failed",
                &["source"]
            )
            .map_err(|e| register_failed("teardown_failures_total", e))?,

            correlation_total: register_counter_vec!(
                "callctx_correlation_total",
                "Transcript correlation outcomes",
                &["outcome"]
            )
            .map_err(|e| register_failed("correlation_total", e))?,

            extraction_total: register_counter_vec!(
                "callctx_extraction_total",
                "Clinical note extraction outcomes",
                &["outcome"]
            )
            .map_err(|e| register_failed("extraction_total", e))?,

            sweeper_actions_total: register_counter_vec!(
                "callctx_sweeper_actions_total",
                "Orphan sweeper actions",
                &["action"]
            )
            .map_err(|e| register_failed("sweeper_actions_total", e))?,

            sweeper_cycles_total: register_counter!(
                "callctx_sweeper_cycles_total",
                "Completed orphan sweeper cycles"
            )
            .map_err(|e| register_failed("sweeper_cycles_total", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_call_started(&self, identified: bool) {
        let label = if identified { "identified" } else { "unidentified" };
        self.calls_started_total.with_label_values(&[label]).inc();
    }

    pub fn record_degraded(&self, stage: &str) {
        self.calls_degraded_total.with_label_values(&[stage]).inc();
    }

    pub fn record_snippet_created(&self) {
        self.snippets_total.with_label_values(&["created"]).inc();
    }

    pub fn record_snippet_destroyed(&self) {
        self.snippets_total.with_label_values(&["destroyed"]).inc();
    }

    pub fn record_teardown_failure(&self, source: &str) {
        self.teardown_failures_total.with_label_values(&[source]).inc();
    }

    pub fn record_correlation(&self, outcome: &str) {
        self.correlation_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_extraction(&self, outcome: &str) {
        self.extraction_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_sweeper_action(&self, action: &str, count: u64) {
        if count > 0 {
            self.sweeper_actions_total
                .with_label_values(&[action])
                .inc_by(count as f64);
        }
    }

    pub fn record_sweeper_cycle(&self) {
        self.sweeper_cycles_total.inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_correlation_counter_increments() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        let before = metrics.correlation_total.with_label_values(&["ambiguous"]).get();
        metrics.record_correlation("ambiguous");
        let after = metrics.correlation_total.with_label_values(&["ambiguous"]).get();
        assert!(after >= before + 1.0);
        Ok(())
    }

    #[test]
    fn test_sweeper_action_skips_zero() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_sweeper_action("retired", 0);
        metrics.record_sweeper_action("destroyed", 3);
        assert!(metrics.sweeper_actions_total.with_label_values(&["destroyed"]).get() >= 3.0);
        Ok(())
    }

    #[test]
    fn test_call_lifecycle_recorders() {
        let metrics = metrics().expect("metrics registered");
        metrics.record_call_started(true);
        metrics.record_call_started(false);
        metrics.record_degraded("attach");
        metrics.record_snippet_created();
        metrics.record_snippet_destroyed();
        metrics.record_teardown_failure("coordinator");
        metrics.record_extraction("skipped");
        metrics.record_http_request("POST", "/api/v1/webhooks/transcript", 202, 0.004);
    }
}
