//! REST API Routes Module
//!
//! One shared [`ApiState`] holding the control facade. Path parameters use
//! the `/:id` syntax.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use vigil_engine::ControlApi;

pub mod checkpoints;
pub mod executions;
pub mod health;

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub control: ControlApi,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(control: ControlApi) -> Self {
        Self {
            control,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the route table without middleware.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/v1/executions",
            post(executions::start_execution).get(executions::list_executions),
        )
        .route("/api/v1/executions/:id", get(executions::get_execution))
        .route("/api/v1/executions/:id/pause", post(executions::pause_execution))
        .route("/api/v1/executions/:id/resume", post(executions::resume_execution))
        .route("/api/v1/executions/:id/stop", post(executions::stop_execution))
        .route("/api/v1/executions/:id/approve", post(executions::approve_step))
        .route("/api/v1/executions/:id/reject", post(executions::reject_step))
        .route(
            "/api/v1/executions/:id/checkpoints",
            get(executions::list_checkpoints).post(executions::create_checkpoint),
        )
        .route("/api/v1/executions/:id/audit", get(executions::audit_trail))
        .route("/api/v1/executions/:id/usage", get(executions::execution_usage))
        .route(
            "/api/v1/checkpoints/:id/rollback",
            post(checkpoints::rollback_checkpoint),
        )
        .with_state(state)
}
