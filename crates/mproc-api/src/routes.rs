//! API routes.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{
    abort_upload, complete_upload, get_upload, health, initiate_upload, list_stale_uploads,
    ready, upload_part,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let upload_routes = Router::new()
        .route("/uploads/multipart/initiate", post(initiate_upload))
        .route("/uploads/multipart/complete", post(complete_upload))
        .route("/uploads/multipart/abort", post(abort_upload))
        .route("/uploads/multipart/stale", get(list_stale_uploads))
        .route("/uploads/multipart/:upload_id", get(get_upload))
        .route(
            "/uploads/multipart/:upload_id/parts/:part_number",
            put(upload_part),
        );

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    let max_body_size = state.config.max_body_size;

    Router::new()
        .nest("/api", upload_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        // Part bodies are buffered; both limits must allow a full chunk.
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
