// src/metrics/mod.rs
// Prometheus metrics surface (spec.md §6 `GET /metrics`).
//
// Grounded on the teacher's `metrics/mod.rs`: a `PrometheusBuilder` installed
// once at startup, plus a `describe_*!` call per series so `/metrics` carries
// HELP text even before the first observation.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder. Must be called exactly once, before any
/// `metrics::counter!`/`histogram!` call fires.
pub fn install() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("prometheus handle already initialized"))?;
    describe();
    Ok(())
}

/// `GET /metrics` (spec.md §6 ambient addition).
pub async fn handle() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()),
    }
}

fn describe() {
    metrics::describe_counter!(
        "threadwire_requests_total",
        "Total proxy requests handled, labeled by domain and classification"
    );
    metrics::describe_histogram!(
        "threadwire_request_duration_seconds",
        "Proxy request duration from receipt to final byte written, labeled by domain"
    );
    metrics::describe_counter!(
        "threadwire_upstream_errors_total",
        "Upstream HTTP/timeout errors observed by the proxy pipeline, labeled by domain and status"
    );
    metrics::describe_counter!(
        "threadwire_tokens_input_total",
        "Input tokens recorded from upstream usage blocks, labeled by domain and model"
    );
    metrics::describe_counter!(
        "threadwire_tokens_output_total",
        "Output tokens recorded from upstream usage blocks, labeled by domain and model"
    );
    metrics::describe_counter!(
        "threadwire_short_id_cleanup_removed_total",
        "Short-id -> UUID mappings evicted by the storage adapter's retention sweep"
    );
    metrics::describe_counter!(
        "threadwire_analysis_jobs_total",
        "Analysis jobs processed by the background worker, labeled by outcome"
    );
    metrics::describe_histogram!(
        "threadwire_analysis_job_duration_seconds",
        "Analysis job wall-clock duration from claim to completion"
    );
    metrics::describe_counter!(
        "threadwire_rate_limit_hits_total",
        "Upstream rate-limit responses observed, labeled by account and limit type"
    );
}
