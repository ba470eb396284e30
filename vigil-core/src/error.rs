//! Error types for VIGIL operations

use crate::{BudgetScope, EntityType, FileAction, HaltReason, StepNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Entity already exists: {entity_type} with id {id}")]
    AlreadyExists { entity_type: EntityType, id: Uuid },

    #[error("Version conflict on {entity_type} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_type: EntityType,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("File operation failed on {path}: {reason}")]
    FileOperation { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid rule pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cannot decode {content_type} payload: {reason}")]
    PayloadDecode { content_type: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Execution state machine, authorization and gating errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Caller {caller} does not own {entity_type} {id}")]
    Forbidden {
        entity_type: EntityType,
        id: Uuid,
        caller: Uuid,
    },

    #[error("Agent {agent_id} is disabled")]
    Disabled { agent_id: Uuid },

    #[error("Cannot {operation} execution {execution_id} while {state}")]
    InvalidTransition {
        execution_id: Uuid,
        operation: String,
        state: String,
    },

    #[error("Action blocked by safety policy: {reason}")]
    SafetyBlocked { reason: String },

    #[error("Budget exceeded ({scope}): spent {spent}, limit {limit}")]
    BudgetExceeded {
        scope: BudgetScope,
        spent: String,
        limit: String,
    },

    #[error("Maximum of {max_steps} steps reached")]
    MaxStepsReached { max_steps: StepNumber },
}

impl ExecutionError {
    /// Halt reason for a refusal the scheduler turns into a halt; `None`
    /// for errors returned to callers.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self {
            ExecutionError::SafetyBlocked { .. } => Some(HaltReason::SafetyBlocked),
            ExecutionError::BudgetExceeded { scope, .. } => {
                Some(HaltReason::BudgetExceeded { scope: *scope })
            }
            ExecutionError::MaxStepsReached { .. } => Some(HaltReason::MaxStepsReached),
            _ => None,
        }
    }
}

/// Errors raised by the external tool/model collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("No tool invoker configured")]
    NotConfigured,

    #[error("Retryable failure from {tool}: {message}")]
    Retryable {
        tool: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Fatal failure from {tool}: {message}")]
    Fatal { tool: String, message: String },
}

impl ToolError {
    pub fn retryable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Retryable {
            tool: tool.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn fatal(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Fatal {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Retryable { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ToolError::Retryable { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// One file operation considered during a rollback replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperationReport {
    pub path: String,
    pub action: FileAction,
    pub error: Option<String>,
}

impl fmt::Display for FileOperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(err) => write!(f, "{} {} ({})", self.action, self.path, err),
            None => write!(f, "{} {}", self.action, self.path),
        }
    }
}

/// A rollback that could not be applied. Nothing it attempted is left
/// applied unless `compensation_failures` is non-empty.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Rollback to checkpoint {checkpoint_id} failed: {reason} ({} attempted, {} failed)",
    .attempted.len(),
    .failed.len()
)]
pub struct RollbackError {
    pub checkpoint_id: Uuid,
    pub reason: String,
    pub attempted: Vec<FileOperationReport>,
    pub failed: Vec<FileOperationReport>,
    pub compensation_failures: Vec<FileOperationReport>,
}

/// Master error type for all VIGIL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VigilError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("Tool invocation error: {0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Rollback(#[from] RollbackError),
}

/// Result type alias for VIGIL operations.
pub type VigilResult<T> = Result<T, VigilError>;

/// Externally visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidTransition,
    Disabled,
    SafetyBlocked,
    BudgetExceeded,
    MaxStepsReached,
    ToolInvocationError,
    RollbackError,
    ConcurrentModification,
    ValidationFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Disabled => "disabled",
            ErrorKind::SafetyBlocked => "safety_blocked",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::MaxStepsReached => "max_steps_reached",
            ErrorKind::ToolInvocationError => "tool_invocation_error",
            ErrorKind::RollbackError => "rollback_error",
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VigilError {
    /// Classify this error for external callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            VigilError::Storage(StorageError::VersionConflict { .. }) => {
                ErrorKind::ConcurrentModification
            }
            VigilError::Storage(_) => ErrorKind::Internal,
            VigilError::Validation(_) => ErrorKind::ValidationFailed,
            VigilError::Config(_) => ErrorKind::Internal,
            VigilError::Execution(err) => match err {
                ExecutionError::NotFound { .. } => ErrorKind::NotFound,
                ExecutionError::Forbidden { .. } => ErrorKind::Forbidden,
                ExecutionError::Disabled { .. } => ErrorKind::Disabled,
                ExecutionError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
                ExecutionError::SafetyBlocked { .. } => ErrorKind::SafetyBlocked,
                ExecutionError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
                ExecutionError::MaxStepsReached { .. } => ErrorKind::MaxStepsReached,
            },
            VigilError::Tool(_) => ErrorKind::ToolInvocationError,
            VigilError::Rollback(_) => ErrorKind::RollbackError,
        }
    }

    pub fn not_found(entity_type: EntityType, id: Uuid) -> Self {
        ExecutionError::NotFound { entity_type, id }.into()
    }

    pub fn forbidden(entity_type: EntityType, id: Uuid, caller: Uuid) -> Self {
        ExecutionError::Forbidden {
            entity_type,
            id,
            caller,
        }
        .into()
    }

    pub fn invalid_transition(
        execution_id: Uuid,
        operation: impl Into<String>,
        state: impl fmt::Display,
    ) -> Self {
        ExecutionError::InvalidTransition {
            execution_id,
            operation: operation.into(),
            state: state.to_string(),
        }
        .into()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity_type: EntityType::Execution,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("execution"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = VigilError::invalid_transition(Uuid::nil(), "approve", "executing");
        let msg = err.to_string();
        assert!(msg.contains("approve"));
        assert!(msg.contains("executing"));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn test_rollback_error_display_counts() {
        let err = RollbackError {
            checkpoint_id: Uuid::nil(),
            reason: "file write failed".to_string(),
            attempted: vec![
                FileOperationReport {
                    path: "a.rs".to_string(),
                    action: FileAction::Write,
                    error: None,
                },
                FileOperationReport {
                    path: "b.rs".to_string(),
                    action: FileAction::Write,
                    error: Some("disk full".to_string()),
                },
            ],
            failed: vec![FileOperationReport {
                path: "b.rs".to_string(),
                action: FileAction::Write,
                error: Some("disk full".to_string()),
            }],
            compensation_failures: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempted"));
        assert!(msg.contains("1 failed"));
        assert_eq!(VigilError::from(err).kind(), ErrorKind::RollbackError);
    }

    #[test]
    fn test_tool_error_classification() {
        let err = ToolError::Retryable {
            tool: "llm".to_string(),
            message: "429".to_string(),
            retry_after_ms: Some(1500),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert!(!ToolError::fatal("llm", "bad request").is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        let conflict = VigilError::from(StorageError::VersionConflict {
            entity_type: EntityType::Execution,
            id: Uuid::nil(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.kind(), ErrorKind::ConcurrentModification);
        assert_eq!(
            VigilError::from(StorageError::LockPoisoned).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            VigilError::forbidden(EntityType::Execution, Uuid::nil(), Uuid::nil()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            VigilError::from(ExecutionError::BudgetExceeded {
                scope: BudgetScope::ExecutionUsd,
                spent: "0.01".to_string(),
                limit: "0.01".to_string(),
            })
            .kind(),
            ErrorKind::BudgetExceeded
        );
    }

    #[test]
    fn test_refusals_carry_halt_reasons() {
        let budget = ExecutionError::BudgetExceeded {
            scope: BudgetScope::AccountDaily,
            spent: "10 tokens".to_string(),
            limit: "10 tokens".to_string(),
        };
        assert_eq!(
            budget.halt_reason(),
            Some(HaltReason::BudgetExceeded {
                scope: BudgetScope::AccountDaily
            })
        );
        assert_eq!(
            ExecutionError::MaxStepsReached { max_steps: 3 }.halt_reason(),
            Some(HaltReason::MaxStepsReached)
        );
        assert_eq!(
            ExecutionError::SafetyBlocked {
                reason: "no force push".to_string()
            }
            .halt_reason(),
            Some(HaltReason::SafetyBlocked)
        );
        assert_eq!(
            ExecutionError::Disabled {
                agent_id: Uuid::nil()
            }
            .halt_reason(),
            None
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::MaxStepsReached).unwrap();
        assert_eq!(json, "\"max_steps_reached\"");
    }
}
