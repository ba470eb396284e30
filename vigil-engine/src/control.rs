//! Control API
//!
//! The surface external callers use. Every operation takes the caller's
//! identity, and every failure comes back as a [`ControlError`] carrying a
//! stable [`ErrorKind`]. Failures are written to the audit log before they
//! are translated; internal failures are reported with a generic message.

use crate::audit::AuditLog;
use crate::budget::{BudgetLedger, UsageScope, UsageTotals};
use crate::controller::{ExecutionController, ExecutionView, StartExecution};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use vigil_checkpoint::RollbackOutcome;
use vigil_core::{
    AgentExecution, AuditEntry, AuditLevel, Checkpoint, CheckpointId, ErrorKind, ExecutionError,
    ExecutionId, RollbackData, StorageError, ToolError, UserId, VigilError, VigilResult,
};

// ============================================================================
// ERRORS
// ============================================================================

/// Structured failure returned to external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&VigilError> for ControlError {
    fn from(err: &VigilError) -> Self {
        let kind = err.kind();
        let message = match kind {
            ErrorKind::Internal => "Internal error".to_string(),
            _ => err.to_string(),
        };
        let error = ControlError::new(kind, message);
        match details_of(err) {
            Some(details) => error.with_details(details),
            None => error,
        }
    }
}

impl From<VigilError> for ControlError {
    fn from(err: VigilError) -> Self {
        ControlError::from(&err)
    }
}

fn details_of(err: &VigilError) -> Option<Value> {
    match err {
        VigilError::Rollback(rollback) => Some(json!({
            "checkpoint_id": rollback.checkpoint_id,
            "reason": rollback.reason,
            "attempted": rollback.attempted,
            "failed": rollback.failed,
            "compensation_failures": rollback.compensation_failures,
        })),
        VigilError::Execution(ExecutionError::BudgetExceeded {
            scope,
            spent,
            limit,
        }) => Some(json!({"scope": scope, "spent": spent, "limit": limit})),
        VigilError::Execution(ExecutionError::InvalidTransition {
            operation, state, ..
        }) => Some(json!({"operation": operation, "state": state})),
        VigilError::Storage(StorageError::VersionConflict {
            expected, actual, ..
        }) => Some(json!({"expected_version": expected, "actual_version": actual})),
        VigilError::Tool(ToolError::Retryable { retry_after_ms, .. }) => {
            Some(json!({"retryable": true, "retry_after_ms": retry_after_ms}))
        }
        _ => None,
    }
}

fn audit_level_for(kind: ErrorKind) -> AuditLevel {
    match kind {
        ErrorKind::Internal
        | ErrorKind::RollbackError
        | ErrorKind::ToolInvocationError
        | ErrorKind::ConcurrentModification => AuditLevel::Error,
        _ => AuditLevel::Warn,
    }
}

// ============================================================================
// FACADE
// ============================================================================

#[derive(Clone)]
pub struct ControlApi {
    controller: Arc<ExecutionController>,
    ledger: BudgetLedger,
    audit: AuditLog,
}

impl ControlApi {
    pub fn new(controller: Arc<ExecutionController>, ledger: BudgetLedger, audit: AuditLog) -> Self {
        Self {
            controller,
            ledger,
            audit,
        }
    }

    pub fn controller(&self) -> &Arc<ExecutionController> {
        &self.controller
    }

    pub async fn start(&self, caller: UserId, request: StartExecution) -> ControlResult<AgentExecution> {
        let result = self.controller.start(caller, request).await;
        self.translate("start", None, result).await
    }

    pub async fn pause(&self, caller: UserId, execution_id: ExecutionId) -> ControlResult<AgentExecution> {
        let result = self.controller.pause(execution_id, caller).await;
        self.translate("pause", Some(execution_id), result).await
    }

    pub async fn resume(&self, caller: UserId, execution_id: ExecutionId) -> ControlResult<AgentExecution> {
        let result = self.controller.resume(execution_id, caller).await;
        self.translate("resume", Some(execution_id), result).await
    }

    pub async fn stop(
        &self,
        caller: UserId,
        execution_id: ExecutionId,
        message: Option<String>,
    ) -> ControlResult<AgentExecution> {
        let result = self.controller.halt(execution_id, caller, message).await;
        self.translate("stop", Some(execution_id), result).await
    }

    pub async fn approve(&self, caller: UserId, execution_id: ExecutionId) -> ControlResult<AgentExecution> {
        let result = self.controller.approve(execution_id, caller).await;
        self.translate("approve", Some(execution_id), result).await
    }

    pub async fn reject(
        &self,
        caller: UserId,
        execution_id: ExecutionId,
        reason: Option<String>,
    ) -> ControlResult<AgentExecution> {
        let result = self.controller.reject(execution_id, caller, reason).await;
        self.translate("reject", Some(execution_id), result).await
    }

    pub async fn rollback(&self, caller: UserId, checkpoint_id: CheckpointId) -> ControlResult<RollbackOutcome> {
        let result = self.controller.rollback(checkpoint_id, caller).await;
        self.translate("rollback", None, result).await
    }

    pub async fn create_checkpoint(
        &self,
        caller: UserId,
        execution_id: ExecutionId,
        description: Option<String>,
        rollback_data: Option<RollbackData>,
    ) -> ControlResult<Checkpoint> {
        let result = self
            .controller
            .create_checkpoint(execution_id, caller, description, rollback_data)
            .await;
        self.translate("create_checkpoint", Some(execution_id), result).await
    }

    pub async fn list_checkpoints(
        &self,
        caller: UserId,
        execution_id: ExecutionId,
    ) -> ControlResult<Vec<Checkpoint>> {
        let result = self.controller.list_checkpoints(execution_id, caller).await;
        self.translate("list_checkpoints", Some(execution_id), result).await
    }

    pub async fn get_state(&self, caller: UserId, execution_id: ExecutionId) -> ControlResult<ExecutionView> {
        let result = self.controller.get_state(execution_id, caller).await;
        self.translate("get_state", Some(execution_id), result).await
    }

    pub async fn list_executions(&self, caller: UserId) -> ControlResult<Vec<AgentExecution>> {
        let result = self.controller.list_executions(caller).await;
        self.translate("list_executions", None, result).await
    }

    pub async fn audit_trail(&self, caller: UserId, execution_id: ExecutionId) -> ControlResult<Vec<AuditEntry>> {
        let result = self.controller.audit_trail(execution_id, caller).await;
        self.translate("audit_trail", Some(execution_id), result).await
    }

    /// The caller's own usage over a scope.
    pub async fn usage(&self, caller: UserId, scope: UsageScope) -> ControlResult<UsageTotals> {
        let result = self.ledger.total_usage(caller, scope).await;
        self.translate("usage", None, result).await
    }

    async fn translate<T>(
        &self,
        operation: &str,
        execution_id: Option<ExecutionId>,
        result: VigilResult<T>,
    ) -> ControlResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let kind = err.kind();
                self.audit
                    .record(
                        execution_id,
                        audit_level_for(kind),
                        "control.error",
                        json!({"operation": operation, "kind": kind, "error": err.to_string()}),
                    )
                    .await;
                Err(ControlError::from(&err))
            }
        }
    }
}

impl std::fmt::Debug for ControlApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlApi")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
