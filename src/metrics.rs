//! Prometheus metrics for a cluster node.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP
//! request metrics, and exposes the `/metrics` endpoint handler.

use std::sync::OnceLock;
use std::time::Instant;

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "sqlcluster_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "sqlcluster_http_request_duration_seconds";

/// Committed commands applied to the local database (counter). Labels: kind, outcome.
pub const COMMANDS_APPLIED_TOTAL: &str = "sqlcluster_commands_applied_total";

/// Client proposals (counter). Labels: outcome.
pub const PROPOSALS_TOTAL: &str = "sqlcluster_proposals_total";

/// Highest committed log index (gauge).
pub const COMMIT_INDEX: &str = "sqlcluster_commit_index";

/// Known cluster members (gauge).
pub const CLUSTER_MEMBERS: &str = "sqlcluster_cluster_members";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::debug!("A global metrics recorder was already installed");
        }
        handle
    })
}

/// Register metric descriptions. Call once after [`init_metrics`].
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        COMMANDS_APPLIED_TOTAL,
        "Committed commands applied to the local database"
    );
    describe_counter!(PROPOSALS_TOTAL, "Client proposals by outcome");
    describe_gauge!(COMMIT_INDEX, "Highest committed log index");
    describe_gauge!(CLUSTER_MEMBERS, "Known cluster members");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware recording request count and latency.
///
/// Excludes `/metrics` itself. Must be the outermost layer.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Map a request path to a bounded label value.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/sql" => "/sql",
        "/health" => "/health",
        "/raft/join" => "/raft/join",
        "/raft/append" => "/raft/append",
        "/raft/propose" => "/raft/propose",
        _ => "other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled\n").into_response(),
    }
}
