//! Checkpoint REST API Routes

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::{
    error::ApiResult,
    extract::{Caller, PathId},
    routes::ApiState,
    types::RollbackResponse,
};

/// POST /api/v1/checkpoints/{id}/rollback
///
/// A failed replay answers `rollback_error` with the attempted and failed
/// file operations in `details`; the execution is left as it was.
pub async fn rollback_checkpoint(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    PathId(checkpoint_id): PathId,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.control.rollback(caller, checkpoint_id).await?;
    Ok(Json(RollbackResponse::from(outcome)))
}
