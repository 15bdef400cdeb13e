//! HTTP request handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;
use vcmw_common::{DestinationId, NewTask, Task};

use super::AppState;
use crate::orchestrator::{ControlOutcome, SessionSnapshot};
use crate::Error;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    /// Pending tasks for the destination, this one included
    pub pending: i64,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub invite: String,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

/// Map worker errors onto HTTP statuses
fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::InvalidInput(_) | Error::Store(vcmw_common::Error::InvalidInput(_)) => {
            StatusCode::BAD_REQUEST
        }
        Error::Store(vcmw_common::Error::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Chat(_) | Error::Voice(_) | Error::Fetch(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    api_error(status, e.to_string())
}

// ============================================================================
// Health Endpoint
// ============================================================================

/// GET /health - keep-alive ping
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "vcmw-worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.orchestrator.active_sessions(),
    })
}

// ============================================================================
// Task Endpoints
// ============================================================================

/// POST /tasks - enqueue a playback request
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let task_id = state
        .store
        .enqueue_task(&request)
        .await
        .map_err(|e| error_response(e.into()))?;
    let pending = state
        .store
        .count_pending(request.destination)
        .await
        .map_err(|e| error_response(e.into()))?;

    info!(task_id = %task_id, destination = %request.destination, pending, "Task submitted");
    Ok((StatusCode::CREATED, Json(SubmitResponse { task_id, pending })))
}

/// GET /tasks/:task_id
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .require(task_id)
        .await
        .map(Json)
        .map_err(|e| error_response(e.into()))
}

// ============================================================================
// Destination Endpoints
// ============================================================================

/// GET /destinations/:destination/session
pub async fn get_session(
    State(state): State<AppState>,
    Path(destination): Path<i64>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .orchestrator
        .session(DestinationId(destination))
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no session in {}", destination)))
}

/// POST /destinations/:destination/stop
pub async fn stop(
    State(state): State<AppState>,
    Path(destination): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    state
        .orchestrator
        .stop(DestinationId(destination))
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /destinations/:destination/skip
pub async fn skip(
    State(state): State<AppState>,
    Path(destination): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    state
        .orchestrator
        .skip(DestinationId(destination))
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /destinations/:destination/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(destination): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    state
        .orchestrator
        .pause(DestinationId(destination))
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /destinations/:destination/resume
pub async fn resume(
    State(state): State<AppState>,
    Path(destination): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    state
        .orchestrator
        .resume(DestinationId(destination))
        .await
        .map(Json)
        .map_err(error_response)
}

// ============================================================================
// Chat Endpoints
// ============================================================================

/// POST /chats/join
pub async fn join_chat(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> Result<Json<ControlOutcome>, ApiError> {
    state
        .orchestrator
        .join(&request.invite)
        .await
        .map(Json)
        .map_err(error_response)
}
