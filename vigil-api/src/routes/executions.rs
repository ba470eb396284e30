//! Execution REST API Routes
//!
//! Thin handlers over [`ControlApi`]: every handler resolves the caller,
//! forwards to one control operation and serializes the result.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;
use vigil_engine::UsageScope;

use crate::{
    error::ApiResult,
    extract::{ApiJson, Caller, PathId},
    routes::ApiState,
    types::{
        CreateCheckpointRequest, ListCheckpointsResponse, ListExecutionsResponse, RejectRequest,
        StartExecutionRequest, StopRequest,
    },
};

// ============================================================================
// LIFECYCLE
// ============================================================================

/// POST /api/v1/executions - Start an execution
pub async fn start_execution(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    ApiJson(req): ApiJson<StartExecutionRequest>,
) -> ApiResult<impl IntoResponse> {
    let execution = state.control.start(caller, req.into()).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

/// GET /api/v1/executions - List the caller's executions
pub async fn list_executions(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
) -> ApiResult<impl IntoResponse> {
    let executions = state.control.list_executions(caller).await?;
    Ok(Json(ListExecutionsResponse { executions }))
}

/// GET /api/v1/executions/{id} - Execution with its steps
pub async fn get_execution(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let view = state.control.get_state(caller, id).await?;
    Ok(Json(view))
}

/// POST /api/v1/executions/{id}/pause
pub async fn pause_execution(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let execution = state.control.pause(caller, id).await?;
    Ok(Json(execution))
}

/// POST /api/v1/executions/{id}/resume
pub async fn resume_execution(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let execution = state.control.resume(caller, id).await?;
    Ok(Json(execution))
}

/// POST /api/v1/executions/{id}/stop - Halt with `user_requested`
pub async fn stop_execution(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
    body: Option<ApiJson<StopRequest>>,
) -> ApiResult<impl IntoResponse> {
    let ApiJson(req) = body.unwrap_or_default();
    let execution = state.control.stop(caller, id, req.message).await?;
    Ok(Json(execution))
}

// ============================================================================
// CONFIRMATION
// ============================================================================

/// POST /api/v1/executions/{id}/approve
pub async fn approve_step(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let execution = state.control.approve(caller, id).await?;
    Ok(Json(execution))
}

/// POST /api/v1/executions/{id}/reject
pub async fn reject_step(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
    body: Option<ApiJson<RejectRequest>>,
) -> ApiResult<impl IntoResponse> {
    let ApiJson(req) = body.unwrap_or_default();
    let execution = state.control.reject(caller, id, req.reason).await?;
    Ok(Json(execution))
}

// ============================================================================
// CHECKPOINTS
// ============================================================================

/// GET /api/v1/executions/{id}/checkpoints
pub async fn list_checkpoints(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let checkpoints = state.control.list_checkpoints(caller, id).await?;
    Ok(Json(ListCheckpointsResponse { checkpoints }))
}

/// POST /api/v1/executions/{id}/checkpoints - Manual checkpoint
pub async fn create_checkpoint(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
    body: Option<ApiJson<CreateCheckpointRequest>>,
) -> ApiResult<impl IntoResponse> {
    let ApiJson(req) = body.unwrap_or_default();
    let checkpoint = state
        .control
        .create_checkpoint(caller, id, req.description, req.rollback_data)
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

// ============================================================================
// OBSERVABILITY
// ============================================================================

/// GET /api/v1/executions/{id}/audit
pub async fn audit_trail(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    let entries = state.control.audit_trail(caller, id).await?;
    Ok(Json(entries))
}

/// GET /api/v1/executions/{id}/usage
pub async fn execution_usage(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(id): PathId,
) -> ApiResult<impl IntoResponse> {
    // Ownership is checked through the state read before totals are returned.
    state.control.get_state(caller, id).await?;
    let totals = state.control.usage(caller, UsageScope::Execution(id)).await?;
    Ok(Json(totals))
}
