//! Worker callbacks: registration and heartbeats, plus census reads.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hatchery_id::WorkerName;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::error::ApiError;
use super::AppState;
use crate::lifecycle::{WorkerState, WorkerStatus, WorkerView};
use crate::model::JobId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/register", post(register))
        .route("/workers/{name}", get(get_worker))
        .route("/workers/{name}/heartbeat", post(heartbeat))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_name: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_name: WorkerName,
    pub token: String,
    pub state: WorkerState,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub status: WorkerStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub state: WorkerState,
}

#[derive(Debug, Serialize)]
struct WorkersResponse {
    items: Vec<WorkerView>,
}

fn parse_name(raw: &str) -> Result<WorkerName, ApiError> {
    WorkerName::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid_worker_name", e.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing_token", "Authorization header is required"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ApiError::unauthorized("invalid_token", "Authorization must be a Bearer token")
        })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_name(&req.worker_name)?;
    let registration =
        state
            .manager()
            .register(&name, req.job_id.as_ref(), &req.model, Instant::now())?;

    Ok(Json(RegisterResponse {
        worker_name: name,
        token: registration.token,
        state: registration.state,
        heartbeat_interval_secs: state.heartbeat_interval().as_secs(),
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_name(&name)?;
    let token = bearer_token(&headers)?;

    let worker_state = state
        .manager()
        .heartbeat(&name, token, req.status, Instant::now())
        .inspect_err(|e| debug!(worker = %name, error = %e, "Heartbeat rejected"))?;

    Ok(Json(HeartbeatResponse {
        state: worker_state,
    }))
}

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(WorkersResponse {
        items: state.manager().snapshot(Instant::now()),
    })
}

async fn get_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_name(&name)?;
    state
        .manager()
        .get(&name, Instant::now())
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found("unknown_worker", format!("unknown worker {name}"))
                .with_instance(name.as_str())
        })
}
