//! VIGIL Storage - Store Traits and In-Memory Implementation
//!
//! Defines the persistence seams of the execution engine: the durable
//! [`ExecutionStore`] for agents, executions, steps, checkpoints and the
//! budget ledger, and the project-scoped [`FileStore`] used by rollback.

pub mod file_store;
pub mod memory;

pub use file_store::{FileStore, InMemoryFileStore};
pub use memory::InMemoryStore;

use ::async_trait::async_trait;
use vigil_core::{
    Agent, AgentExecution, AgentId, BudgetUsageRecord, Checkpoint, CheckpointId, ExecutionId,
    ExecutionStep, StepNumber, Timestamp, UserBudgetSettings, UserId, VigilResult,
};

// ============================================================================
// QUERY TYPES
// ============================================================================

/// Filter for ledger queries. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageQuery {
    pub user_id: Option<UserId>,
    pub execution_id: Option<ExecutionId>,
    /// Inclusive lower bound on `recorded_at`.
    pub since: Option<Timestamp>,
    /// Exclusive upper bound on `recorded_at`.
    pub until: Option<Timestamp>,
}

impl UsageQuery {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn for_execution(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Default::default()
        }
    }

    pub fn between(mut self, since: Timestamp, until: Timestamp) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, record: &BudgetUsageRecord) -> bool {
        self.user_id.is_none_or(|u| record.user_id == u)
            && self
                .execution_id
                .is_none_or(|e| record.execution_id == Some(e))
            && self.since.is_none_or(|s| record.recorded_at >= s)
            && self.until.is_none_or(|u| record.recorded_at < u)
    }
}

// ============================================================================
// EXECUTION STORE
// ============================================================================

/// Durable store for engine entities.
///
/// Execution writes are compare-and-swap on [`AgentExecution::version`]: the
/// write succeeds only when the stored version equals the caller's copy, and
/// the returned record carries the incremented version. A stale write fails
/// with `StorageError::VersionConflict`.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ========================================================================
    // AGENT OPERATIONS
    // ========================================================================

    async fn agent_insert(&self, agent: &Agent) -> VigilResult<()>;

    async fn agent_get(&self, id: AgentId) -> VigilResult<Option<Agent>>;

    async fn agent_update(&self, agent: &Agent) -> VigilResult<()>;

    // ========================================================================
    // EXECUTION OPERATIONS
    // ========================================================================

    async fn execution_insert(&self, execution: &AgentExecution) -> VigilResult<()>;

    async fn execution_get(&self, id: ExecutionId) -> VigilResult<Option<AgentExecution>>;

    /// List executions owned by a user, oldest first.
    async fn execution_list_by_user(&self, user_id: UserId) -> VigilResult<Vec<AgentExecution>>;

    /// CAS update of the execution record alone.
    async fn execution_update(&self, execution: &AgentExecution) -> VigilResult<AgentExecution>;

    /// CAS update of the execution plus insert-or-replace of `steps`, as one
    /// atomic write.
    async fn execution_commit(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution>;

    /// CAS update of the execution and wholesale replacement of its step
    /// list, as one atomic write. Used by rollback.
    async fn execution_restore(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution>;

    // ========================================================================
    // STEP OPERATIONS
    // ========================================================================

    async fn step_get(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
    ) -> VigilResult<Option<ExecutionStep>>;

    /// Steps of an execution ordered by step number.
    async fn step_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<ExecutionStep>>;

    // ========================================================================
    // CHECKPOINT OPERATIONS
    // ========================================================================

    /// Insert a checkpoint. Checkpoints are never updated or deleted.
    async fn checkpoint_insert(&self, checkpoint: &Checkpoint) -> VigilResult<()>;

    async fn checkpoint_get(&self, id: CheckpointId) -> VigilResult<Option<Checkpoint>>;

    /// Checkpoints of an execution ordered by step number, then creation.
    async fn checkpoint_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<Checkpoint>>;

    // ========================================================================
    // LEDGER OPERATIONS
    // ========================================================================

    /// Append one usage record. Records are never updated or deleted.
    async fn usage_append(&self, record: &BudgetUsageRecord) -> VigilResult<()>;

    async fn usage_query(&self, query: &UsageQuery) -> VigilResult<Vec<BudgetUsageRecord>>;

    async fn budget_settings_get(&self, user_id: UserId)
        -> VigilResult<Option<UserBudgetSettings>>;

    async fn budget_settings_put(&self, settings: &UserBudgetSettings) -> VigilResult<()>;
}
