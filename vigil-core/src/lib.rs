//! VIGIL Core - Entity Types
//!
//! Data types shared by every VIGIL crate: identities, the execution state
//! machine, entities, money, policy, configuration and the error taxonomy.
//! This crate contains no I/O.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod money;
pub mod policy;

pub use config::{DispatchMode, EngineConfig, ModelPrice, PricingConfig, RetryConfig};
pub use entities::{
    Agent, AgentExecution, AuditEntry, BudgetUsageRecord, Checkpoint, CheckpointSnapshot,
    ContextMap, ExecutionStep, FileSnapshot, Payload, RollbackData, StepAction,
    UserBudgetSettings, CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
};
pub use enums::{
    AuditLevel, BudgetScope, EntityType, EnumParseError, ExecutionState, FileAction, HaltReason,
    RejectAction, RiskLevel, RuleType, StepStatus,
};
pub use error::{
    ConfigError, ErrorKind, ExecutionError, FileOperationReport, RollbackError, StorageError,
    ToolError, ValidationError, VigilError, VigilResult,
};
pub use identity::{
    compute_content_hash, content_hash_hex, new_entity_id, AgentId, CheckpointId, ContentHash,
    EntityId, ExecutionId, ProjectId, StepNumber, Timestamp, UserId,
};
pub use money::{Usd, UsdParseError};
pub use policy::{AgentPolicy, SafetyCheckResult, SafetyRule};
