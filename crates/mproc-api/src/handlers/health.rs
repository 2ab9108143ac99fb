//! Liveness and readiness endpoints.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub version: &'static str,
}

/// Always answers while the process can serve requests.
pub async fn health() -> Json<Liveness> {
    Json(Liveness {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness: the object store answers and how many uploads are open.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub ready: bool,
    pub store_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub open_sessions: usize,
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let started = Instant::now();
    let store_error = state
        .store
        .check_connectivity()
        .await
        .err()
        .map(|e| e.to_string());

    let readiness = Readiness {
        ready: store_error.is_none(),
        store_latency_ms: started.elapsed().as_millis() as u64,
        store_error,
        open_sessions: state.sessions.len(),
    };
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
