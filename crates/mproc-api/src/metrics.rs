//! Prometheus metrics for the API server.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "mproc_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mproc_http_request_duration_seconds";
    pub const UPLOAD_SESSIONS_TOTAL: &str = "mproc_upload_sessions_total";
    pub const UPLOAD_PARTS_TOTAL: &str = "mproc_upload_parts_total";
    pub const UPLOAD_PART_BYTES_TOTAL: &str = "mproc_upload_part_bytes_total";
}

/// Install the Prometheus recorder and return a handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record an upload session reaching `outcome` (initiated, completed, aborted).
pub fn record_upload_session(outcome: &'static str) {
    counter!(names::UPLOAD_SESSIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_upload_part(bytes: usize) {
    counter!(names::UPLOAD_PARTS_TOTAL).increment(1);
    counter!(names::UPLOAD_PART_BYTES_TOTAL).increment(bytes as u64);
}

/// Middleware recording count and latency per route template.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    // Route templates keep upload IDs out of label values.
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
