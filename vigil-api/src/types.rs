//! Request and response bodies.

use serde::{Deserialize, Serialize};
use vigil_checkpoint::RollbackOutcome;
use vigil_core::{
    AgentExecution, AgentId, Checkpoint, ContextMap, FileOperationReport, RollbackData,
    StepAction,
};
use vigil_engine::StartExecution;

// ============================================================================
// REQUESTS
// ============================================================================

/// POST /api/v1/executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub agent_id: AgentId,
    pub goal: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub stopping_conditions: Vec<String>,
    #[serde(default)]
    pub context: ContextMap,
    /// Convenience for `context.plan`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<StepAction>>,
}

impl From<StartExecutionRequest> for StartExecution {
    fn from(req: StartExecutionRequest) -> Self {
        let start = StartExecution::new(req.agent_id, req.goal)
            .with_assumptions(req.assumptions)
            .with_stopping_conditions(req.stopping_conditions)
            .with_context(req.context);
        match req.plan {
            Some(plan) => start.with_plan(&plan),
            None => start,
        }
    }
}

/// POST /api/v1/executions/{id}/stop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /api/v1/executions/{id}/reject
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/executions/{id}/checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCheckpointRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rollback_data: Option<RollbackData>,
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<AgentExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListCheckpointsResponse {
    pub checkpoints: Vec<Checkpoint>,
}

/// POST /api/v1/checkpoints/{id}/rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResponse {
    pub checkpoint: Checkpoint,
    pub execution: AgentExecution,
    pub files_restored: Vec<FileOperationReport>,
}

impl From<RollbackOutcome> for RollbackResponse {
    fn from(outcome: RollbackOutcome) -> Self {
        Self {
            checkpoint: outcome.checkpoint,
            execution: outcome.execution,
            files_restored: outcome.files_restored,
        }
    }
}
