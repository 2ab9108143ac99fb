//! Axum HTTP API for the media pipeline.
//!
//! This crate provides:
//! - The multipart upload contract (initiate, upload part, complete, abort)
//! - An upload session registry between HTTP calls
//! - Liveness/readiness endpoints and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod sessions;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use sessions::SessionRegistry;
pub use state::AppState;
