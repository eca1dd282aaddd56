//! Health check endpoints.
//!
//! `/readyz` reports the governor status and turns 503 once the backend has
//! rejected our credentials, since no further workers can be spawned.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

use super::AppState;
use crate::governor::GovernorStatus;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,

    /// Hatchery name.
    pub hatchery: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerCounts>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(test, serde(skip_deserializing))]
    pub governor: Option<GovernorStatus>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct WorkerCounts {
    pub live: usize,
    pub tracked: usize,
    pub max: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(state: &AppState, ok: bool) -> HealthResponse {
    HealthResponse {
        status: if ok { "ok" } else { "degraded" }.to_string(),
        service: "hatchery".to_string(),
        hatchery: state.hatchery().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        workers: None,
        governor: None,
    }
}

/// The process is up. Does not look at the backend.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(response(&state, true))
}

/// Ready to provision workers.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let governor = state.governor().status(Instant::now());
    let manager = state.manager();
    let ok = governor.halted.is_none();

    let mut body = response(&state, ok);
    body.workers = Some(WorkerCounts {
        live: manager.live_count(),
        tracked: manager.len(),
        max: manager.max_workers(),
    });
    body.governor = Some(governor);

    if ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
