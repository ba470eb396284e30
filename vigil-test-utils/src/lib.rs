//! VIGIL Test Utilities
//!
//! Shared test infrastructure for the VIGIL workspace:
//! - Proptest generators for policies, rules, actions and usage
//! - Fixtures for agents and executions
//! - A file store that fails on demand, for rollback tests
//! - An execution store that fails ledger appends or checkpoint writes
//! - Custom assertions

pub use vigil_storage::{InMemoryFileStore, InMemoryStore};
pub use vigil_tools::{MockToolInvoker, ToolResponse, ToolUsage};

pub use vigil_core::{
    Agent, AgentExecution, AgentPolicy, BudgetUsageRecord, ExecutionState, ProjectId, RiskLevel,
    RuleType, SafetyCheckResult, SafetyRule, StepAction, StorageError, Usd, UserId, VigilError,
    VigilResult,
};

use ::async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vigil_core::{
    AgentId, Checkpoint, CheckpointId, ExecutionId, ExecutionStep, StepNumber,
    UserBudgetSettings,
};
use vigil_storage::{ExecutionStore, FileStore, UsageQuery};

// ============================================================================
// FAILING FILE STORE
// ============================================================================

/// Wraps a [`FileStore`] and fails selected operations.
///
/// Writes and deletes to paths registered with [`fail_writes_to`] fail, as
/// does every mutating operation once the budget set by
/// [`fail_after_ops`] is used up. Reads always pass through.
///
/// [`fail_writes_to`]: FailingFileStore::fail_writes_to
/// [`fail_after_ops`]: FailingFileStore::fail_after_ops
pub struct FailingFileStore {
    inner: Arc<dyn FileStore>,
    failing_paths: Mutex<HashSet<String>>,
    remaining_ops: Mutex<Option<usize>>,
    mutations: AtomicUsize,
}

impl FailingFileStore {
    pub fn new(inner: Arc<dyn FileStore>) -> Self {
        Self {
            inner,
            failing_paths: Mutex::new(HashSet::new()),
            remaining_ops: Mutex::new(None),
            mutations: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes_to(&self, path: impl Into<String>) {
        self.failing_paths
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.into());
    }

    /// Allow `ops` more mutating operations, then fail all of them.
    pub fn fail_after_ops(&self, ops: usize) {
        *self.remaining_ops.lock().unwrap_or_else(|p| p.into_inner()) = Some(ops);
    }

    /// Clear every failure trigger.
    pub fn heal(&self) {
        self.failing_paths.lock().unwrap_or_else(|p| p.into_inner()).clear();
        *self.remaining_ops.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Number of mutating operations that reached the inner store.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> VigilResult<()> {
        if self
            .failing_paths
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(path)
        {
            return Err(injected(path));
        }
        let mut remaining = self.remaining_ops.lock().unwrap_or_else(|p| p.into_inner());
        match remaining.as_mut() {
            Some(0) => return Err(injected(path)),
            Some(n) => *n -= 1,
            None => {}
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for FailingFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingFileStore")
            .field("mutations", &self.mutation_count())
            .finish_non_exhaustive()
    }
}

fn injected(path: &str) -> VigilError {
    StorageError::FileOperation {
        path: path.to_string(),
        reason: "injected failure".to_string(),
    }
    .into()
}

#[async_trait]
impl FileStore for FailingFileStore {
    async fn read(&self, project_id: ProjectId, path: &str) -> VigilResult<Option<Vec<u8>>> {
        self.inner.read(project_id, path).await
    }

    async fn write(&self, project_id: ProjectId, path: &str, content: &[u8]) -> VigilResult<()> {
        self.check(path)?;
        self.inner.write(project_id, path, content).await
    }

    async fn delete(&self, project_id: ProjectId, path: &str) -> VigilResult<()> {
        self.check(path)?;
        self.inner.delete(project_id, path).await
    }
}

// ============================================================================
// FAILING EXECUTION STORE
// ============================================================================

/// Wraps an [`ExecutionStore`] and fails ledger appends or checkpoint
/// inserts on demand. Everything else passes through.
pub struct FailingStore {
    inner: Arc<dyn ExecutionStore>,
    fail_usage: AtomicBool,
    checkpoint_allowance: Mutex<Option<usize>>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ExecutionStore>) -> Self {
        Self {
            inner,
            fail_usage: AtomicBool::new(false),
            checkpoint_allowance: Mutex::new(None),
        }
    }

    /// Fail every `usage_append` from now on.
    pub fn fail_usage_appends(&self) {
        self.fail_usage.store(true, Ordering::SeqCst);
    }

    /// Allow `inserts` more checkpoint inserts, then fail all of them.
    pub fn fail_checkpoints_after(&self, inserts: usize) {
        *self
            .checkpoint_allowance
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(inserts);
    }

    pub fn heal(&self) {
        self.fail_usage.store(false, Ordering::SeqCst);
        *self
            .checkpoint_allowance
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn checkpoint_allowed(&self) -> bool {
        let mut allowance = self
            .checkpoint_allowance
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match allowance.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

impl std::fmt::Debug for FailingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingStore")
            .field("fail_usage", &self.fail_usage.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn injected_write(what: &str) -> VigilError {
    StorageError::TransactionFailed {
        reason: format!("injected {} failure", what),
    }
    .into()
}

#[async_trait]
impl ExecutionStore for FailingStore {
    async fn agent_insert(&self, agent: &Agent) -> VigilResult<()> {
        self.inner.agent_insert(agent).await
    }

    async fn agent_get(&self, id: AgentId) -> VigilResult<Option<Agent>> {
        self.inner.agent_get(id).await
    }

    async fn agent_update(&self, agent: &Agent) -> VigilResult<()> {
        self.inner.agent_update(agent).await
    }

    async fn execution_insert(&self, execution: &AgentExecution) -> VigilResult<()> {
        self.inner.execution_insert(execution).await
    }

    async fn execution_get(&self, id: ExecutionId) -> VigilResult<Option<AgentExecution>> {
        self.inner.execution_get(id).await
    }

    async fn execution_list_by_user(&self, user_id: UserId) -> VigilResult<Vec<AgentExecution>> {
        self.inner.execution_list_by_user(user_id).await
    }

    async fn execution_update(&self, execution: &AgentExecution) -> VigilResult<AgentExecution> {
        self.inner.execution_update(execution).await
    }

    async fn execution_commit(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution> {
        self.inner.execution_commit(execution, steps).await
    }

    async fn execution_restore(
        &self,
        execution: &AgentExecution,
        steps: &[ExecutionStep],
    ) -> VigilResult<AgentExecution> {
        self.inner.execution_restore(execution, steps).await
    }

    async fn step_get(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
    ) -> VigilResult<Option<ExecutionStep>> {
        self.inner.step_get(execution_id, step_number).await
    }

    async fn step_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<ExecutionStep>> {
        self.inner.step_list(execution_id).await
    }

    async fn checkpoint_insert(&self, checkpoint: &Checkpoint) -> VigilResult<()> {
        if !self.checkpoint_allowed() {
            return Err(injected_write("checkpoint"));
        }
        self.inner.checkpoint_insert(checkpoint).await
    }

    async fn checkpoint_get(&self, id: CheckpointId) -> VigilResult<Option<Checkpoint>> {
        self.inner.checkpoint_get(id).await
    }

    async fn checkpoint_list(&self, execution_id: ExecutionId) -> VigilResult<Vec<Checkpoint>> {
        self.inner.checkpoint_list(execution_id).await
    }

    async fn usage_append(&self, record: &BudgetUsageRecord) -> VigilResult<()> {
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(injected_write("usage append"));
        }
        self.inner.usage_append(record).await
    }

    async fn usage_query(&self, query: &UsageQuery) -> VigilResult<Vec<BudgetUsageRecord>> {
        self.inner.usage_query(query).await
    }

    async fn budget_settings_get(
        &self,
        user_id: UserId,
    ) -> VigilResult<Option<UserBudgetSettings>> {
        self.inner.budget_settings_get(user_id).await
    }

    async fn budget_settings_put(&self, settings: &UserBudgetSettings) -> VigilResult<()> {
        self.inner.budget_settings_put(settings).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for engine inputs.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_risk_level() -> impl Strategy<Value = RiskLevel> {
        prop_oneof![
            Just(RiskLevel::Low),
            Just(RiskLevel::Medium),
            Just(RiskLevel::High),
        ]
    }

    pub fn arb_rule_type() -> impl Strategy<Value = RuleType> {
        prop_oneof![
            Just(RuleType::Allow),
            Just(RuleType::Deny),
            Just(RuleType::Confirm),
        ]
    }

    /// Lower-case word from a small vocabulary, so generated rules and
    /// descriptions overlap often enough to exercise matching.
    pub fn arb_word() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "delete", "file", "files", "write", "read", "deploy", "prod", "drop", "table",
            "refactor", "module", "test", "config", "secret", "rm", "git", "push",
        ])
        .prop_map(str::to_string)
    }

    /// A plain-text pattern of one to three words.
    pub fn arb_word_pattern() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_word(), 1..=3).prop_map(|w| w.join(" "))
    }

    /// A pattern in any of the three forms: `/regex/`, substring, or words.
    pub fn arb_pattern() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => arb_word_pattern(),
            1 => arb_word().prop_map(|w| format!("/\\b{}\\b/", w)),
            1 => (arb_word(), arb_word()).prop_map(|(a, b)| format!("/{}.*{}/", a, b)),
        ]
    }

    pub fn arb_rule() -> impl Strategy<Value = SafetyRule> {
        (arb_rule_type(), arb_pattern()).prop_map(|(t, p)| SafetyRule::new(t, p))
    }

    pub fn arb_rules() -> impl Strategy<Value = Vec<SafetyRule>> {
        prop::collection::vec(arb_rule(), 0..8)
    }

    pub fn arb_description() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_word(), 1..10).prop_map(|w| w.join(" "))
    }

    pub fn arb_usd(max_cents: i64) -> impl Strategy<Value = Usd> {
        (0..=max_cents).prop_map(Usd::from_cents)
    }

    pub fn arb_action() -> impl Strategy<Value = StepAction> {
        (
            arb_description(),
            any::<bool>(),
            any::<bool>(),
            prop::option::of(0.0f64..=1.0),
            prop::option::of(arb_usd(500)),
        )
            .prop_map(|(description, modifies, expands, uncertainty, cost)| {
                let mut action = StepAction::new("llm", description)
                    .with_modifies_files(modifies)
                    .with_expands_scope(expands);
                if let Some(u) = uncertainty {
                    action = action.with_uncertainty(u);
                }
                if let Some(c) = cost {
                    action = action.with_estimated_cost(c);
                }
                action
            })
    }

    pub fn arb_policy() -> impl Strategy<Value = AgentPolicy> {
        (
            1u32..50,
            0.0f64..=1.0,
            any::<bool>(),
            any::<bool>(),
            prop::option::of(arb_usd(10_000)),
            arb_rules(),
        )
            .prop_map(|(max_steps, threshold, approval, expand, limit, rules)| {
                let mut policy = AgentPolicy::default()
                    .with_max_steps(max_steps)
                    .with_uncertainty_threshold(threshold)
                    .with_require_approval_for_changes(approval)
                    .with_allow_scope_expansion(expand);
                if let Some(limit) = limit {
                    policy = policy.with_budget_limit_usd(limit);
                }
                policy.rules = rules;
                policy
            })
    }

    /// Usage amounts as (tokens, cost) pairs.
    pub fn arb_usage_amounts() -> impl Strategy<Value = Vec<(u64, Usd)>> {
        prop::collection::vec((0u64..10_000, arb_usd(1_000)), 0..20)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made entities for common scenarios.

    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    /// Enabled agent owned by a fresh user with the given policy.
    pub fn make_agent(policy: AgentPolicy) -> Agent {
        Agent::new(Uuid::now_v7(), Uuid::now_v7(), "test-agent", policy)
    }

    pub fn make_agent_for(owner: UserId, policy: AgentPolicy) -> Agent {
        Agent::new(owner, Uuid::now_v7(), "test-agent", policy)
    }

    /// Execution in `planning` for `agent`.
    pub fn make_execution(agent: &Agent) -> AgentExecution {
        AgentExecution::new(agent, "test goal")
    }

    /// Policy with a high step cap and no rules.
    pub fn permissive_policy() -> AgentPolicy {
        AgentPolicy::default().with_max_steps(100)
    }

    /// Policy denying `rm -rf` and asking before any deploy.
    pub fn guarded_policy() -> AgentPolicy {
        AgentPolicy::default()
            .with_rule(SafetyRule::deny("rm -rf").with_description("destructive delete"))
            .with_rule(SafetyRule::confirm("/deploy.*prod/").with_description("production deploy"))
    }

    pub fn usage_record(
        user_id: UserId,
        execution_id: Option<Uuid>,
        tokens: u64,
        cost: Usd,
    ) -> BudgetUsageRecord {
        BudgetUsageRecord {
            record_id: Uuid::now_v7(),
            user_id,
            execution_id,
            step_number: None,
            tokens_used: tokens,
            cost,
            model: "test-model".to_string(),
            operation: "invoke".to_string(),
            recorded_at: Utc::now(),
        }
    }

    /// Mock invoker answering `text` with the given usage.
    pub fn scripted_invoker(responses: &[(&str, u64, Option<Usd>)]) -> MockToolInvoker {
        let mock = MockToolInvoker::new("llm");
        for (text, tokens, cost) in responses {
            let mut response = ToolResponse::text(*text, ToolUsage::new(*tokens / 2, *tokens - *tokens / 2));
            if let Some(cost) = cost {
                response = response.with_cost(*cost);
            }
            mock.push_response(response);
        }
        mock
    }

    /// Stored agent and execution, both inserted.
    pub async fn seeded_execution(
        store: &InMemoryStore,
        policy: AgentPolicy,
    ) -> VigilResult<(Agent, AgentExecution)> {
        use vigil_storage::ExecutionStore;
        let agent = make_agent(policy);
        store.agent_insert(&agent).await?;
        let execution = make_execution(&agent);
        store.execution_insert(&execution).await?;
        Ok((agent, execution))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

/// Assert a safety result blocks, with the given risk level.
pub fn assert_blocked(result: &SafetyCheckResult, risk: RiskLevel) {
    assert!(!result.allowed, "expected block, got {:?}", result);
    assert!(!result.requires_confirmation, "block must not ask for confirmation");
    assert_eq!(result.risk_level, risk);
}

/// Assert a safety result asks for confirmation.
pub fn assert_needs_confirmation(result: &SafetyCheckResult) {
    assert!(result.allowed, "confirmation result must be allowed: {:?}", result);
    assert!(result.requires_confirmation, "expected confirmation: {:?}", result);
}

/// Assert an execution is halted for the given reason.
pub fn assert_halted(execution: &AgentExecution, reason: vigil_core::HaltReason) {
    match &execution.state {
        ExecutionState::Halted { reason: actual, .. } => assert_eq!(*actual, reason),
        other => panic!("expected halted({}), got {}", reason.as_db_str(), other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_failing_store_fails_registered_path() {
        let inner = Arc::new(InMemoryFileStore::new());
        let store = FailingFileStore::new(inner.clone());
        let project = Uuid::now_v7();
        store.fail_writes_to("bad.rs");

        assert!(store.write(project, "good.rs", b"x").await.is_ok());
        assert!(store.write(project, "bad.rs", b"x").await.is_err());
        assert_eq!(inner.read(project, "bad.rs").await.unwrap(), None);
        assert_eq!(store.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_store_op_budget_and_heal() {
        let store = FailingFileStore::new(Arc::new(InMemoryFileStore::new()));
        let project = Uuid::now_v7();
        store.fail_after_ops(1);

        assert!(store.write(project, "a", b"1").await.is_ok());
        assert!(store.delete(project, "a").await.is_err());
        store.heal();
        assert!(store.delete(project, "a").await.is_ok());
    }
}
