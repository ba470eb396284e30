//! In-memory [`ExecutionStore`] for tests and single-process deployments.

use crate::{ExecutionStore, UsageQuery};
use ::async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vigil_core::{
    Agent, AgentExecution, AgentId, BudgetUsageRecord, Checkpoint, CheckpointId, EntityType,
    ExecutionId, ExecutionStep, StepNumber, StorageError, UserBudgetSettings, UserId,
    VigilResult,
};

#[derive(Debug, Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    executions: HashMap<ExecutionId, AgentExecution>,
    steps: HashMap<ExecutionId, BTreeMap<StepNumber, ExecutionStep>>,
    checkpoints: HashMap<CheckpointId, Checkpoint>,
    usage: Vec<BudgetUsageRecord>,
    budget_settings: HashMap<UserId, UserBudgetSettings>,
}

impl Tables {
    /// Check the caller's version against the stored one and return the
    /// record to store.
    fn cas(&self, execution: &AgentExecution) -> VigilResult<AgentExecution> {
        let stored = self.executions.get(&execution.execution_id).ok_or(
            StorageError::NotFound {
                entity_type: EntityType::Execution,
                id: execution.execution_id,
            },
        )?;
        if stored.version != execution.version {
            return Err(StorageError::VersionConflict {
                entity_type: EntityType::Execution,
                id: execution.execution_id,
                expected: execution.version,
                actual: stored.version,
            }
            .into());
        }
        let mut next = execution.clone();
        next.version = stored.version + 1;
        Ok(next)
    }

    fn check_steps_belong(&self, execution_id: ExecutionId, steps: &[ExecutionStep]) -> VigilResult<()> {
        if let Some(stray) = steps.iter().find(|s| s.execution_id != execution_id) {
            return Err(StorageError::TransactionFailed {
                reason: format!(
                    "step {} belongs to execution {}, not {}",
                    stray.step_number, stray.execution_id, execution_id
                ),
            }
            .into());
        }
        Ok(())
    }
}

/// In-memory store. Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> VigilResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> VigilResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Total number of ledger records, for diagnostics.
    pub fn usage_count(&self) -> VigilResult<usize> {
        Ok(self.read()?.usage.len())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    // === Agent Operations ===

    async fn agent_insert(&self, agent: &Agent) -> VigilResult<()> {
        let mut tables = self.write()?;
        if tables.agents.contains_key(&agent.agent_id) {
            return Err(StorageError::AlreadyExists {
                entity_type: EntityType::Agent,
                id: agent.agent_id,
            }
            .into());
        }
        tables.agents.insert(agent.agent_id, agent.clone());
        Ok(())
    }

    async fn agent_get(&self, id: AgentId) -> VigilResult<Option<Agent>> {
        Ok(self.read()?.agents.get(&id).cloned())
    }

    async fn agent_update(&self, agent: &Agent) -> VigilResult<()> {
        let mut tables = self.write()?;
        let slot = tables.agents.get_mut(&agent.agent_id).ok_or(StorageError::NotFound {
            entity_type: EntityType::Agent,
            id: agent.agent_id,
        })?;
        *slot = agent.clone();
        Ok(())
    }

    // === Execution Operations ===

    async fn execution_insert(&self, execution: &AgentExecution) -> VigilResult<()> {
        let mut tables = self.write()?;
        if tables.executions.contains_key(&execution.execution_id) {
            return Err(StorageError::AlreadyExists {
                entity_type: EntityType::Execution,
                id: execution.execution_id,
            }
            .into());
        }
        tables
            .executions
            .insert(execution.execution_id, execution.clone());
        tables.steps.entry(execution.execution_id).or_default();
        Ok(())
    }

    async fn execution_get(&self, id: ExecutionId) -> VigilResult<Option<AgentExecution>> {
        Ok(self.read()?.executions.get(&id).cloned())
    }

    async fn execution_list_by_user(&self, user_id: UserId) -> VigilResult<Vec<AgentExecution>> {
        let tables = self.read()?;
        let mut executions: Vec<AgentExecution> = tables
            .executions
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.started_at, e.execution_id));
        Ok(executions)
    }

    async fn execution_update(&self, execution: &AgentExecution) -> VigilResult<AgentExecution> {
        let mut tables = self.write()?;
        let next = tables.cas(execution)?;
        tables.executions.insert(next.execution_id, next.clone());
        Ok(next)
    }

    async fn execution_commit(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution> {
        let mut tables = self.write()?;
        tables.check_steps_belong(execution.execution_id, steps)?;
        let next = tables.cas(execution)?;
        let step_table = tables.steps.entry(next.execution_id).or_default();
        for step in steps {
            step_table.insert(step.step_number, step.clone());
        }
        tables.executions.insert(next.execution_id, next.clone());
        Ok(next)
    }

    async fn execution_restore(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution> {
        let mut tables = self.write()?;
        tables.check_steps_belong(execution.execution_id, steps)?;
        let next = tables.cas(execution)?;
        let replacement: BTreeMap<StepNumber, ExecutionStep> = steps
            .iter()
            .map(|s| (s.step_number, s.clone()))
            .collect();
        tables.steps.insert(next.execution_id, replacement);
        tables.executions.insert(next.execution_id, next.clone());
        Ok(next)
    }

    // === Step Operations ===

    async fn step_get(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
    ) -> VigilResult<Option<ExecutionStep>> {
        let tables = self.read()?;
        Ok(tables
            .steps
            .get(&execution_id)
            .and_then(|steps| steps.get(&step_number))
            .cloned())
    }

    async fn step_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<ExecutionStep>> {
        let tables = self.read()?;
        Ok(tables
            .steps
            .get(&execution_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    // === Checkpoint Operations ===

    async fn checkpoint_insert(&self, checkpoint: &Checkpoint) -> VigilResult<()> {
        let mut tables = self.write()?;
        if tables.checkpoints.contains_key(&checkpoint.checkpoint_id) {
            return Err(StorageError::AlreadyExists {
                entity_type: EntityType::Checkpoint,
                id: checkpoint.checkpoint_id,
            }
            .into());
        }
        tables
            .checkpoints
            .insert(checkpoint.checkpoint_id, checkpoint.clone());
        Ok(())
    }

    async fn checkpoint_get(&self, id: CheckpointId) -> VigilResult<Option<Checkpoint>> {
        Ok(self.read()?.checkpoints.get(&id).cloned())
    }

    async fn checkpoint_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<Checkpoint>> {
        let tables = self.read()?;
        let mut checkpoints: Vec<Checkpoint> = tables
            .checkpoints
            .values()
            .filter(|c| c.execution_id == execution_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| (c.step_number, c.created_at, c.checkpoint_id));
        Ok(checkpoints)
    }

    // === Ledger Operations ===

    async fn usage_append(&self, record: &BudgetUsageRecord) -> VigilResult<()> {
        let mut tables = self.write()?;
        if tables.usage.iter().any(|r| r.record_id == record.record_id) {
            return Err(StorageError::AlreadyExists {
                entity_type: EntityType::UsageRecord,
                id: record.record_id,
            }
            .into());
        }
        tables.usage.push(record.clone());
        Ok(())
    }

    async fn usage_query(&self, query: &UsageQuery) -> VigilResult<Vec<BudgetUsageRecord>> {
        let tables = self.read()?;
        Ok(tables
            .usage
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn budget_settings_get(
        &self,
        user_id: UserId,
    ) -> VigilResult<Option<UserBudgetSettings>> {
        Ok(self.read()?.budget_settings.get(&user_id).cloned())
    }

    async fn budget_settings_put(&self, settings: &UserBudgetSettings) -> VigilResult<()> {
        let mut tables = self.write()?;
        tables
            .budget_settings
            .insert(settings.user_id, settings.clone());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;
    use vigil_core::Usd;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Property: Every appended usage record is returned by an execution query
        #[test]
        fn prop_usage_query_returns_all_appended(tokens in prop::collection::vec(0u64..10_000, 0..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = InMemoryStore::new();
            let user = Uuid::now_v7();
            let execution_id = Uuid::now_v7();

            runtime.block_on(async {
                for t in &tokens {
                    let record = BudgetUsageRecord {
                        record_id: Uuid::now_v7(),
                        user_id: user,
                        execution_id: Some(execution_id),
                        step_number: None,
                        tokens_used: *t,
                        cost: Usd::ZERO,
                        model: "m".to_string(),
                        operation: "op".to_string(),
                        recorded_at: Utc::now(),
                    };
                    store.usage_append(&record).await.unwrap();
                }
            });

            let found = runtime
                .block_on(store.usage_query(&UsageQuery::for_execution(execution_id)))
                .unwrap();
            prop_assert_eq!(found.len(), tokens.len());
            let total: u64 = found.iter().map(|r| r.tokens_used).sum();
            prop_assert_eq!(total, tokens.iter().sum::<u64>());
        }
    }
}
