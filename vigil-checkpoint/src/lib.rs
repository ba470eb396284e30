//! VIGIL Checkpoint - Snapshot Capture and Rollback
//!
//! A checkpoint is a value copy of an execution's restorable state plus the
//! file contents needed to undo side effects. Checkpoints are write-once:
//! nothing in this crate updates or deletes one.
//!
//! Rollback is all-or-nothing. File operations run first, each preceded by a
//! read of the content it replaces; if any operation fails, the ones already
//! applied are undone in reverse order and the execution record is left
//! untouched. Only after every file operation succeeded is the execution
//! restored, in a single compare-and-swap write. If that write fails the file
//! operations are undone as well.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use vigil_core::{
    AgentExecution, Checkpoint, CheckpointId, CheckpointSnapshot, EntityType, ExecutionId,
    FileAction, FileOperationReport, FileSnapshot, ProjectId, RollbackData, RollbackError,
    StepNumber, UserId, ValidationError, VigilError, VigilResult,
};
use vigil_storage::{ExecutionStore, FileStore};

// ============================================================================
// TYPES
// ============================================================================

/// Where a new checkpoint's rollback data comes from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RollbackCapture {
    /// No rollback data.
    None,
    /// Read the current content of every path in `files_modified`.
    #[default]
    FilesModified,
    /// Caller-supplied data, stored as given.
    Provided(RollbackData),
}

/// Result of a successful rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    pub checkpoint: Checkpoint,
    /// Execution as persisted after the restore.
    pub execution: AgentExecution,
    pub files_restored: Vec<FileOperationReport>,
}

/// A file operation that was applied and can be undone.
struct AppliedOperation {
    path: String,
    prior: Option<Vec<u8>>,
}

// ============================================================================
// CHECKPOINT MANAGER
// ============================================================================

/// Creates, lists and restores checkpoints.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn ExecutionStore>,
    files: Arc<dyn FileStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn ExecutionStore>, files: Arc<dyn FileStore>) -> Self {
        Self { store, files }
    }

    /// Capture the persisted state of an execution, with rollback data read
    /// from the file store for every modified path.
    pub async fn create(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
        description: Option<String>,
        automatic: bool,
    ) -> VigilResult<Checkpoint> {
        self.create_with(
            execution_id,
            step_number,
            description,
            automatic,
            RollbackCapture::FilesModified,
        )
        .await
    }

    pub async fn create_with(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
        description: Option<String>,
        automatic: bool,
        capture: RollbackCapture,
    ) -> VigilResult<Checkpoint> {
        let execution = self.load_execution(execution_id).await?;
        if step_number > execution.current_step {
            return Err(ValidationError::InvalidValue {
                field: "step_number".to_string(),
                reason: format!(
                    "checkpoint step {} is ahead of current step {}",
                    step_number, execution.current_step
                ),
            }
            .into());
        }

        let steps = self.store.step_list(execution_id).await?;
        let snapshot = CheckpointSnapshot::capture(&execution, &steps);

        let rollback_data = match capture {
            RollbackCapture::None => None,
            RollbackCapture::Provided(data) => Some(data),
            RollbackCapture::FilesModified => Some(
                self.capture_files(execution.project_id, &execution.files_modified)
                    .await?,
            ),
        };

        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::now_v7(),
            execution_id,
            step_number,
            description,
            automatic,
            snapshot,
            rollback_data,
            created_at: Utc::now(),
        };
        self.store.checkpoint_insert(&checkpoint).await?;

        tracing::info!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            step_number,
            automatic,
            files = checkpoint
                .rollback_data
                .as_ref()
                .map(|d| d.file_snapshots.len())
                .unwrap_or(0),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Read the current content of `paths`. Missing files become delete
    /// operations so a rollback removes them.
    pub async fn capture_files(
        &self,
        project_id: ProjectId,
        paths: &[String],
    ) -> VigilResult<RollbackData> {
        let mut file_snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            let snapshot = match self.files.read(project_id, path).await? {
                Some(content) => FileSnapshot::write(path.clone(), content),
                None => FileSnapshot::delete(path.clone()),
            };
            file_snapshots.push(snapshot);
        }
        Ok(RollbackData {
            file_snapshots,
            db_changes: Vec::new(),
        })
    }

    /// Checkpoints of an execution, ascending by step number.
    pub async fn list(&self, execution_id: ExecutionId) -> VigilResult<Vec<Checkpoint>> {
        self.store.checkpoint_list(execution_id).await
    }

    pub async fn get(&self, checkpoint_id: CheckpointId) -> VigilResult<Checkpoint> {
        self.store
            .checkpoint_get(checkpoint_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Checkpoint, checkpoint_id))
    }

    pub async fn latest(&self, execution_id: ExecutionId) -> VigilResult<Option<Checkpoint>> {
        Ok(self.list(execution_id).await?.pop())
    }

    /// Restore an execution to a checkpoint.
    ///
    /// The caller must own the execution, and the execution must not be
    /// mid-step (`executing`); pause it first. Callers are expected to hold
    /// the execution's lock.
    pub async fn rollback(
        &self,
        checkpoint_id: CheckpointId,
        caller_id: UserId,
    ) -> VigilResult<RollbackOutcome> {
        let checkpoint = self.get(checkpoint_id).await?;
        let execution = self.load_execution(checkpoint.execution_id).await?;

        if execution.user_id != caller_id {
            return Err(VigilError::forbidden(
                EntityType::Execution,
                execution.execution_id,
                caller_id,
            ));
        }
        if execution.state.is_executing() {
            return Err(VigilError::invalid_transition(
                execution.execution_id,
                "rollback",
                &execution.state,
            ));
        }

        let operations = checkpoint
            .rollback_data
            .as_ref()
            .map(|d| d.file_snapshots.as_slice())
            .unwrap_or_default();
        let applied = self
            .replay_files(&checkpoint, execution.project_id, operations)
            .await?;

        let restored = checkpoint.snapshot.restore_onto(&execution);
        let persisted = match self
            .store
            .execution_restore(&restored, &checkpoint.snapshot.steps)
            .await
        {
            Ok(persisted) => persisted,
            Err(err) => {
                let attempted = reports_for(operations, None);
                let compensation_failures = self.compensate(execution.project_id, applied).await;
                tracing::warn!(
                    execution_id = %execution.execution_id,
                    checkpoint_id = %checkpoint_id,
                    error = %err,
                    "execution restore failed, file changes undone"
                );
                return Err(RollbackError {
                    checkpoint_id,
                    reason: format!("execution restore failed: {}", err),
                    attempted,
                    failed: Vec::new(),
                    compensation_failures,
                }
                .into());
            }
        };

        tracing::info!(
            execution_id = %persisted.execution_id,
            checkpoint_id = %checkpoint_id,
            step_number = checkpoint.step_number,
            current_step = persisted.current_step,
            files = operations.len(),
            "rolled back to checkpoint"
        );

        Ok(RollbackOutcome {
            files_restored: reports_for(operations, None),
            execution: persisted,
            checkpoint,
        })
    }

    /// Apply every file operation or none of them.
    async fn replay_files(
        &self,
        checkpoint: &Checkpoint,
        project_id: ProjectId,
        operations: &[FileSnapshot],
    ) -> VigilResult<Vec<AppliedOperation>> {
        let mut applied: Vec<AppliedOperation> = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            match self.apply_one(project_id, op).await {
                Ok(prior) => applied.push(AppliedOperation {
                    path: op.path.clone(),
                    prior,
                }),
                Err(reason) => {
                    let mut attempted = reports_for(&operations[..index], None);
                    let failed = FileOperationReport {
                        path: op.path.clone(),
                        action: op.action,
                        error: Some(reason.clone()),
                    };
                    attempted.push(failed.clone());
                    let compensation_failures = self.compensate(project_id, applied).await;

                    tracing::warn!(
                        execution_id = %checkpoint.execution_id,
                        checkpoint_id = %checkpoint.checkpoint_id,
                        path = %op.path,
                        error = %reason,
                        undone = index,
                        compensation_failures = compensation_failures.len(),
                        "file replay failed"
                    );
                    return Err(RollbackError {
                        checkpoint_id: checkpoint.checkpoint_id,
                        reason: format!("{} {} failed: {}", op.action, op.path, reason),
                        attempted,
                        failed: vec![failed],
                        compensation_failures,
                    }
                    .into());
                }
            }
        }

        Ok(applied)
    }

    /// Apply one operation, returning the content it replaced.
    async fn apply_one(
        &self,
        project_id: ProjectId,
        op: &FileSnapshot,
    ) -> Result<Option<Vec<u8>>, String> {
        let prior = self
            .files
            .read(project_id, &op.path)
            .await
            .map_err(|e| format!("read before replay: {}", e))?;

        match op.action {
            FileAction::Write => {
                let content = op
                    .content
                    .as_deref()
                    .ok_or_else(|| "write snapshot has no content".to_string())?;
                self.files
                    .write(project_id, &op.path, content)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            FileAction::Delete => {
                self.files
                    .delete(project_id, &op.path)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(prior)
    }

    /// Undo applied operations, newest first. Returns the ones that could
    /// not be undone.
    async fn compensate(
        &self,
        project_id: ProjectId,
        applied: Vec<AppliedOperation>,
    ) -> Vec<FileOperationReport> {
        let mut failures = Vec::new();
        for op in applied.into_iter().rev() {
            let (action, result) = match &op.prior {
                Some(content) => (
                    FileAction::Write,
                    self.files.write(project_id, &op.path, content).await,
                ),
                None => (FileAction::Delete, self.files.delete(project_id, &op.path).await),
            };
            if let Err(err) = result {
                tracing::error!(path = %op.path, error = %err, "failed to undo file operation");
                failures.push(FileOperationReport {
                    path: op.path,
                    action,
                    error: Some(err.to_string()),
                });
            }
        }
        failures
    }

    async fn load_execution(&self, execution_id: ExecutionId) -> VigilResult<AgentExecution> {
        self.store
            .execution_get(execution_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Execution, execution_id))
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

fn reports_for(operations: &[FileSnapshot], error: Option<String>) -> Vec<FileOperationReport> {
    operations
        .iter()
        .map(|op| FileOperationReport {
            path: op.path.clone(),
            action: op.action,
            error: error.clone(),
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{
        Agent, AgentPolicy, ErrorKind, ExecutionState, ExecutionStep, StepAction, StepStatus,
    };
    use vigil_storage::{InMemoryFileStore, InMemoryStore};
    use vigil_test_utils::FailingFileStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        files: Arc<InMemoryFileStore>,
        manager: CheckpointManager,
        execution: AgentExecution,
    }

    async fn make_fixture_with_files(files: Arc<dyn FileStore>, raw: Arc<InMemoryFileStore>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let agent = Agent::new(Uuid::now_v7(), Uuid::now_v7(), "agent", AgentPolicy::default());
        store.agent_insert(&agent).await.unwrap();
        let mut execution = AgentExecution::new(&agent, "goal");
        execution.state = ExecutionState::Executing;
        store.execution_insert(&execution).await.unwrap();
        Fixture {
            manager: CheckpointManager::new(store.clone(), files),
            store,
            files: raw,
            execution,
        }
    }

    async fn make_fixture() -> Fixture {
        let files = Arc::new(InMemoryFileStore::new());
        make_fixture_with_files(files.clone(), files).await
    }

    /// Persist `n` completed steps and touch one file per step.
    async fn advance(fx: &mut Fixture, n: u32) {
        for _ in 0..n {
            let mut exec = fx.store.execution_get(fx.execution.execution_id).await.unwrap().unwrap();
            let number = exec.next_step_number();
            let mut step = ExecutionStep::new(
                exec.execution_id,
                number,
                StepAction::new("edit", format!("edit file {}", number)),
            );
            step.set_status(StepStatus::Complete {
                completed_at: Utc::now(),
            });
            let path = format!("src/file_{}.rs", number);
            fx.files
                .write(exec.project_id, &path, format!("v{}", number).as_bytes())
                .await
                .unwrap();
            exec.record_files_modified([path]);
            exec.current_step += 1;
            exec.total_steps += 1;
            fx.execution = fx.store.execution_commit(&exec, &[step]).await.unwrap();
        }
    }

    async fn pause(fx: &mut Fixture) {
        let mut exec = fx.store.execution_get(fx.execution.execution_id).await.unwrap().unwrap();
        exec.set_state(ExecutionState::Paused {
            paused_at: Utc::now(),
        });
        fx.execution = fx.store.execution_update(&exec).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_captures_value_copy() {
        let mut fx = make_fixture().await;
        advance(&mut fx, 2).await;

        let checkpoint = fx
            .manager
            .create(fx.execution.execution_id, 2, Some("two".to_string()), false)
            .await
            .unwrap();

        assert_eq!(checkpoint.snapshot.current_step, 2);
        assert_eq!(checkpoint.snapshot.steps.len(), 2);
        let data = checkpoint.rollback_data.unwrap();
        assert_eq!(data.file_snapshots.len(), 2);
        assert_eq!(data.file_snapshots[0].content.as_deref(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn test_create_rejects_future_step() {
        let fx = make_fixture().await;
        let err = fx
            .manager
            .create(fx.execution.execution_id, 5, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_create_unknown_execution_not_found() {
        let fx = make_fixture().await;
        let err = fx.manager.create(Uuid::now_v7(), 0, None, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_latest_and_get() {
        let mut fx = make_fixture().await;
        advance(&mut fx, 1).await;
        let first = fx.manager.create(fx.execution.execution_id, 1, None, true).await.unwrap();
        advance(&mut fx, 1).await;
        let second = fx.manager.create(fx.execution.execution_id, 2, None, true).await.unwrap();

        let listed = fx.manager.list(fx.execution.execution_id).await.unwrap();
        assert_eq!(listed, vec![first.clone(), second.clone()]);
        assert_eq!(
            fx.manager.latest(fx.execution.execution_id).await.unwrap(),
            Some(second)
        );
        assert_eq!(fx.manager.get(first.checkpoint_id).await.unwrap(), first);
        assert_eq!(
            fx.manager.get(Uuid::now_v7()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_state_steps_and_files() {
        let mut fx = make_fixture().await;
        advance(&mut fx, 1).await;
        let checkpoint = fx.manager.create(fx.execution.execution_id, 1, None, true).await.unwrap();
        advance(&mut fx, 2).await;
        fx.files
            .write(fx.execution.project_id, "src/file_1.rs", b"clobbered")
            .await
            .unwrap();
        pause(&mut fx).await;

        let outcome = fx
            .manager
            .rollback(checkpoint.checkpoint_id, fx.execution.user_id)
            .await
            .unwrap();

        assert_eq!(outcome.execution.current_step, 1);
        assert_eq!(outcome.execution.state, checkpoint.snapshot.state);
        assert_eq!(outcome.execution.last_step_number, 3);
        let steps = fx.store.step_list(fx.execution.execution_id).await.unwrap();
        assert_eq!(steps, checkpoint.snapshot.steps);
        assert_eq!(
            fx.files.read(fx.execution.project_id, "src/file_1.rs").await.unwrap(),
            Some(b"v1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rollback_foreign_caller_forbidden() {
        let mut fx = make_fixture().await;
        let checkpoint = fx.manager.create(fx.execution.execution_id, 0, None, true).await.unwrap();
        pause(&mut fx).await;

        let err = fx
            .manager
            .rollback(checkpoint.checkpoint_id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_rollback_while_executing_is_invalid() {
        let fx = make_fixture().await;
        let checkpoint = fx.manager.create(fx.execution.execution_id, 0, None, true).await.unwrap();

        let err = fx
            .manager
            .rollback(checkpoint.checkpoint_id, fx.execution.user_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_rollback_with_failing_write_leaves_everything_unchanged() {
        let raw = Arc::new(InMemoryFileStore::new());
        let failing = Arc::new(FailingFileStore::new(raw.clone()));
        let mut fx = make_fixture_with_files(failing.clone(), raw.clone()).await;
        advance(&mut fx, 2).await;
        let checkpoint = fx.manager.create(fx.execution.execution_id, 2, None, true).await.unwrap();
        advance(&mut fx, 1).await;
        raw.write(fx.execution.project_id, "src/file_1.rs", b"new one").await.unwrap();
        raw.write(fx.execution.project_id, "src/file_2.rs", b"new two").await.unwrap();
        pause(&mut fx).await;
        let before = fx.store.execution_get(fx.execution.execution_id).await.unwrap().unwrap();

        failing.fail_writes_to("src/file_2.rs");
        let err = fx
            .manager
            .rollback(checkpoint.checkpoint_id, fx.execution.user_id)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RollbackError);
        match err {
            VigilError::Rollback(report) => {
                assert_eq!(report.attempted.len(), 2);
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].path, "src/file_2.rs");
                assert!(report.compensation_failures.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let after = fx.store.execution_get(fx.execution.execution_id).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(after.current_step, 3);
        assert_eq!(
            raw.read(fx.execution.project_id, "src/file_1.rs").await.unwrap(),
            Some(b"new one".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rollback_restore_conflict_undoes_files() {
        let raw = Arc::new(InMemoryFileStore::new());
        let mut fx = make_fixture_with_files(raw.clone(), raw.clone()).await;
        advance(&mut fx, 1).await;
        let checkpoint = fx.manager.create(fx.execution.execution_id, 1, None, true).await.unwrap();
        raw.write(fx.execution.project_id, "src/file_1.rs", b"later").await.unwrap();
        pause(&mut fx).await;

        let stale_store = Arc::new(ConflictingStore(fx.store.clone()));
        let manager = CheckpointManager::new(stale_store, raw.clone());
        let err = manager
            .rollback(checkpoint.checkpoint_id, fx.execution.user_id)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RollbackError);
        assert_eq!(
            raw.read(fx.execution.project_id, "src/file_1.rs").await.unwrap(),
            Some(b"later".to_vec())
        );
    }

    #[tokio::test]
    async fn test_checkpoints_never_change_after_rollback() {
        let mut fx = make_fixture().await;
        advance(&mut fx, 1).await;
        let early = fx.manager.create(fx.execution.execution_id, 1, None, true).await.unwrap();
        advance(&mut fx, 1).await;
        let late = fx.manager.create(fx.execution.execution_id, 2, None, true).await.unwrap();
        pause(&mut fx).await;

        fx.manager.rollback(early.checkpoint_id, fx.execution.user_id).await.unwrap();

        let listed = fx.manager.list(fx.execution.execution_id).await.unwrap();
        assert_eq!(listed, vec![early, late]);
    }

    /// Store whose restore always loses the CAS race.
    struct ConflictingStore(Arc<InMemoryStore>);

    #[::async_trait::async_trait]
    impl ExecutionStore for ConflictingStore {
        async fn agent_insert(&self, a: &vigil_core::Agent) -> VigilResult<()> {
            self.0.agent_insert(a).await
        }
        async fn agent_get(&self, id: Uuid) -> VigilResult<Option<vigil_core::Agent>> {
            self.0.agent_get(id).await
        }
        async fn agent_update(&self, a: &vigil_core::Agent) -> VigilResult<()> {
            self.0.agent_update(a).await
        }
        async fn execution_insert(&self, e: &AgentExecution) -> VigilResult<()> {
            self.0.execution_insert(e).await
        }
        async fn execution_get(&self, id: Uuid) -> VigilResult<Option<AgentExecution>> {
            self.0.execution_get(id).await
        }
        async fn execution_list_by_user(&self, u: Uuid) -> VigilResult<Vec<AgentExecution>> {
            self.0.execution_list_by_user(u).await
        }
        async fn execution_update(&self, e: &AgentExecution) -> VigilResult<AgentExecution> {
            self.0.execution_update(e).await
        }
        async fn execution_commit(
            &self,
            e: &AgentExecution,
            s: &[ExecutionStep],
        ) -> VigilResult<AgentExecution> {
            self.0.execution_commit(e, s).await
        }
        async fn execution_restore(
            &self,
            e: &AgentExecution,
            _s: &[ExecutionStep],
        ) -> VigilResult<AgentExecution> {
            Err(vigil_core::StorageError::VersionConflict {
                entity_type: EntityType::Execution,
                id: e.execution_id,
                expected: e.version,
                actual: e.version + 1,
            }
            .into())
        }
        async fn step_get(&self, e: Uuid, n: StepNumber) -> VigilResult<Option<ExecutionStep>> {
            self.0.step_get(e, n).await
        }
        async fn step_list(&self, e: Uuid) -> VigilResult<Vec<ExecutionStep>> {
            self.0.step_list(e).await
        }
        async fn checkpoint_insert(&self, c: &Checkpoint) -> VigilResult<()> {
            self.0.checkpoint_insert(c).await
        }
        async fn checkpoint_get(&self, id: Uuid) -> VigilResult<Option<Checkpoint>> {
            self.0.checkpoint_get(id).await
        }
        async fn checkpoint_list(&self, e: Uuid) -> VigilResult<Vec<Checkpoint>> {
            self.0.checkpoint_list(e).await
        }
        async fn usage_append(&self, r: &vigil_core::BudgetUsageRecord) -> VigilResult<()> {
            self.0.usage_append(r).await
        }
        async fn usage_query(
            &self,
            q: &vigil_storage::UsageQuery,
        ) -> VigilResult<Vec<vigil_core::BudgetUsageRecord>> {
            self.0.usage_query(q).await
        }
        async fn budget_settings_get(
            &self,
            u: Uuid,
        ) -> VigilResult<Option<vigil_core::UserBudgetSettings>> {
            self.0.budget_settings_get(u).await
        }
        async fn budget_settings_put(
            &self,
            s: &vigil_core::UserBudgetSettings,
        ) -> VigilResult<()> {
            self.0.budget_settings_put(s).await
        }
    }
}
