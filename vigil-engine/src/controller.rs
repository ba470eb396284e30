//! Execution Controller
//!
//! Owns the execution state machine:
//!
//! ```text
//! planning ─→ executing ⇄ awaiting_confirmation
//!                │  ↑
//!          pause │  │ resume
//!                ↓  │
//!               paused
//!
//! executing ─→ completed | failed | halted
//! any non-terminal ─ halt ─→ halted
//! ```
//!
//! Every transition is persisted under the execution lock before anything
//! acts on it. Operations that leave the execution `executing` then hand it
//! to the scheduler according to the configured [`DispatchMode`].

use crate::audit::AuditLog;
use crate::locks::ExecutionLocks;
use crate::planner::PLAN_CONTEXT_KEY;
use crate::scheduler::{RunReport, StepScheduler};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use vigil_checkpoint::{CheckpointManager, RollbackCapture, RollbackOutcome};
use vigil_core::{
    Agent, AgentExecution, AgentId, AuditEntry, Checkpoint, CheckpointId, ContextMap,
    DispatchMode, EntityType, ExecutionError, ExecutionId, ExecutionState, ExecutionStep,
    HaltReason, RejectAction, RollbackData, StepAction, StepStatus, UserId, ValidationError,
    VigilError, VigilResult,
};
use vigil_storage::ExecutionStore;

// ============================================================================
// REQUEST / VIEW TYPES
// ============================================================================

/// Parameters of [`ExecutionController::start`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartExecution {
    pub agent_id: AgentId,
    pub goal: String,
    pub assumptions: Vec<String>,
    pub stopping_conditions: Vec<String>,
    pub context: ContextMap,
}

impl StartExecution {
    pub fn new(agent_id: AgentId, goal: impl Into<String>) -> Self {
        Self {
            agent_id,
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_assumptions(mut self, assumptions: Vec<String>) -> Self {
        self.assumptions = assumptions;
        self
    }

    pub fn with_stopping_conditions(mut self, conditions: Vec<String>) -> Self {
        self.stopping_conditions = conditions;
        self
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    /// Store a plan for the context planner.
    pub fn with_plan(mut self, plan: &[StepAction]) -> Self {
        let entries = plan
            .iter()
            .filter_map(|action| serde_json::to_value(action).ok())
            .collect();
        self.context
            .insert(PLAN_CONTEXT_KEY.to_string(), Value::Array(entries));
        self
    }
}

/// Execution with its steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionView {
    pub execution: AgentExecution,
    pub steps: Vec<ExecutionStep>,
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct ExecutionController {
    store: Arc<dyn ExecutionStore>,
    scheduler: Arc<StepScheduler>,
    checkpoints: CheckpointManager,
    audit: AuditLog,
    locks: Arc<ExecutionLocks>,
    dispatch_mode: DispatchMode,
}

impl ExecutionController {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        scheduler: Arc<StepScheduler>,
        checkpoints: CheckpointManager,
        audit: AuditLog,
        locks: Arc<ExecutionLocks>,
        dispatch_mode: DispatchMode,
    ) -> Self {
        Self {
            store,
            scheduler,
            checkpoints,
            audit,
            locks,
            dispatch_mode,
        }
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Whether a step loop currently owns the execution.
    pub fn is_loop_active(&self, execution_id: ExecutionId) -> bool {
        self.locks.loop_active(execution_id)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Create an execution for an agent the caller owns and start it.
    pub async fn start(&self, caller: UserId, request: StartExecution) -> VigilResult<AgentExecution> {
        let agent = self
            .store
            .agent_get(request.agent_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Agent, request.agent_id))?;
        if agent.owner_user_id != caller {
            return Err(VigilError::forbidden(EntityType::Agent, agent.agent_id, caller));
        }
        if !agent.enabled {
            return Err(ExecutionError::Disabled {
                agent_id: agent.agent_id,
            }
            .into());
        }
        agent.policy.validate()?;
        if request.goal.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "goal".to_string(),
            }
            .into());
        }

        let execution = AgentExecution::new(&agent, request.goal)
            .with_assumptions(request.assumptions)
            .with_stopping_conditions(request.stopping_conditions)
            .with_context(request.context);
        let execution_id = execution.execution_id;
        self.store.execution_insert(&execution).await?;
        self.audit
            .info(
                execution_id,
                "execution.created",
                json!({"agent_id": agent.agent_id, "goal": execution.goal}),
            )
            .await;

        let execution = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = execution;
            execution.set_state(ExecutionState::Executing);
            let execution = self.store.execution_update(&execution).await?;
            self.initial_checkpoint(&agent, execution).await?
        };

        tracing::info!(
            execution_id = %execution_id,
            agent_id = %agent.agent_id,
            user_id = %caller,
            "execution started"
        );
        self.audit
            .info(execution_id, "execution.started", json!({"max_steps": agent.policy.max_steps}))
            .await;
        self.dispatch(execution).await
    }

    /// Step-zero checkpoint so an execution can always be rewound to its
    /// start. Failing to take it fails the execution.
    async fn initial_checkpoint(
        &self,
        agent: &Agent,
        execution: AgentExecution,
    ) -> VigilResult<AgentExecution> {
        if !agent.policy.auto_checkpoint {
            return Ok(execution);
        }
        match self
            .checkpoints
            .create(execution.execution_id, 0, Some("Initial state".to_string()), true)
            .await
        {
            Ok(_) => Ok(execution),
            Err(err) => {
                let mut failed = execution;
                failed.fail(err.kind().as_str(), format!("initial checkpoint failed: {}", err));
                self.store.execution_update(&failed).await?;
                Err(err)
            }
        }
    }

    pub async fn pause(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<AgentExecution> {
        let _guard = self.locks.lock(execution_id).await;
        let mut execution = self.load_owned(execution_id, caller).await?;
        if !execution.state.is_executing() {
            return Err(VigilError::invalid_transition(execution_id, "pause", &execution.state));
        }

        execution.set_state(ExecutionState::Paused {
            paused_at: Utc::now(),
        });
        let paused = self.store.execution_update(&execution).await?;
        self.audit
            .info(
                execution_id,
                "execution.paused",
                json!({
                    "current_step": paused.current_step,
                    "step_in_flight": self.locks.loop_active(execution_id),
                }),
            )
            .await;
        Ok(paused)
    }

    pub async fn resume(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<AgentExecution> {
        let resumed = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = self.load_owned(execution_id, caller).await?;
            if !matches!(execution.state, ExecutionState::Paused { .. }) {
                return Err(VigilError::invalid_transition(execution_id, "resume", &execution.state));
            }
            execution.set_state(ExecutionState::Executing);
            self.store.execution_update(&execution).await?
        };
        self.audit
            .info(execution_id, "execution.resumed", json!({"current_step": resumed.current_step}))
            .await;
        self.dispatch(resumed).await
    }

    /// Halt from any non-terminal state. A step in flight runs to completion;
    /// no further step starts.
    pub async fn halt(
        &self,
        execution_id: ExecutionId,
        caller: UserId,
        message: Option<String>,
    ) -> VigilResult<AgentExecution> {
        let halted = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = self.load_owned(execution_id, caller).await?;
            if execution.is_terminal() {
                return Err(VigilError::invalid_transition(execution_id, "halt", &execution.state));
            }

            // A step awaiting confirmation, or approved but not yet picked up,
            // never runs.
            let undispatched = match execution.state {
                ExecutionState::AwaitingConfirmation { step_number, .. } => {
                    self.store.step_get(execution_id, step_number).await?
                }
                _ => self
                    .store
                    .step_list(execution_id)
                    .await?
                    .pop()
                    .filter(|s| matches!(s.status, StepStatus::Pending { approved: true })),
            };
            let mut steps = Vec::new();
            if let Some(mut step) = undispatched {
                step.set_status(StepStatus::Skipped {
                    reason: "execution halted".to_string(),
                });
                steps.push(step);
            }
            let message = message.unwrap_or_else(|| "Halted by user".to_string());
            execution.halt(HaltReason::UserRequested, message.clone());
            let halted = self.store.execution_commit(&execution, &steps).await?;
            self.audit
                .info(
                    execution_id,
                    "execution.halted",
                    json!({"reason": HaltReason::UserRequested, "message": message}),
                )
                .await;
            halted
        };
        self.locks.forget(execution_id);
        Ok(halted)
    }

    // ========================================================================
    // CONFIRMATION GATE
    // ========================================================================

    /// Approve the step awaiting confirmation and continue with it.
    pub async fn approve(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<AgentExecution> {
        let approved = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = self.load_owned(execution_id, caller).await?;
            let ExecutionState::AwaitingConfirmation { step_number, .. } = execution.state else {
                return Err(VigilError::invalid_transition(execution_id, "approve", &execution.state));
            };

            let mut step = self.load_step(execution_id, step_number).await?;
            step.set_status(StepStatus::Pending { approved: true });
            execution.set_state(ExecutionState::Executing);
            let approved = self.store.execution_commit(&execution, &[step]).await?;
            self.audit
                .info(execution_id, "step.approved", json!({"step_number": step_number}))
                .await;
            approved
        };
        self.dispatch(approved).await
    }

    /// Reject the step awaiting confirmation. The step is skipped; the
    /// execution halts or continues according to the agent's `on_reject`.
    pub async fn reject(
        &self,
        execution_id: ExecutionId,
        caller: UserId,
        reason: Option<String>,
    ) -> VigilResult<AgentExecution> {
        let rejected = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = self.load_owned(execution_id, caller).await?;
            let ExecutionState::AwaitingConfirmation { step_number, .. } = execution.state else {
                return Err(VigilError::invalid_transition(execution_id, "reject", &execution.state));
            };
            let agent = self.load_agent(&execution).await?;

            let reason = reason.unwrap_or_else(|| "rejected by user".to_string());
            let mut step = self.load_step(execution_id, step_number).await?;
            step.set_status(StepStatus::Skipped {
                reason: format!("Rejected: {}", reason),
            });
            match agent.policy.on_reject {
                RejectAction::Halt => execution.halt(HaltReason::UserRejected, reason.clone()),
                RejectAction::Skip => execution.set_state(ExecutionState::Executing),
            }
            let rejected = self.store.execution_commit(&execution, &[step]).await?;
            self.audit
                .info(
                    execution_id,
                    "step.rejected",
                    json!({
                        "step_number": step_number,
                        "reason": reason,
                        "on_reject": agent.policy.on_reject,
                    }),
                )
                .await;
            rejected
        };

        if rejected.state.is_executing() {
            self.dispatch(rejected).await
        } else {
            self.locks.forget(execution_id);
            Ok(rejected)
        }
    }

    // ========================================================================
    // CHECKPOINTS
    // ========================================================================

    /// Restore an execution to a checkpoint. Refused while a step is in
    /// flight; an execution restored into `executing` is picked up again.
    pub async fn rollback(
        &self,
        checkpoint_id: CheckpointId,
        caller: UserId,
    ) -> VigilResult<RollbackOutcome> {
        let checkpoint = self.checkpoints.get(checkpoint_id).await?;
        let execution_id = checkpoint.execution_id;

        let mut outcome = {
            let _guard = self.locks.lock(execution_id).await;
            let execution = self.load_owned(execution_id, caller).await?;
            self.ensure_quiescent(&execution, "rollback")?;

            match self.checkpoints.rollback(checkpoint_id, caller).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.audit
                        .error(
                            Some(execution_id),
                            "execution.rollback_failed",
                            json!({"checkpoint_id": checkpoint_id, "error": err.to_string()}),
                        )
                        .await;
                    return Err(err);
                }
            }
        };

        self.audit
            .info(
                execution_id,
                "execution.rolled_back",
                json!({
                    "checkpoint_id": checkpoint_id,
                    "step_number": outcome.checkpoint.step_number,
                    "current_step": outcome.execution.current_step,
                    "files_restored": outcome.files_restored.len(),
                }),
            )
            .await;

        if outcome.execution.state.is_executing() {
            outcome.execution = self.dispatch(outcome.execution.clone()).await?;
        }
        Ok(outcome)
    }

    /// Manual checkpoint at the current step. Caller-supplied rollback data
    /// is stored as given; otherwise modified files are captured.
    pub async fn create_checkpoint(
        &self,
        execution_id: ExecutionId,
        caller: UserId,
        description: Option<String>,
        rollback_data: Option<RollbackData>,
    ) -> VigilResult<Checkpoint> {
        let _guard = self.locks.lock(execution_id).await;
        let execution = self.load_owned(execution_id, caller).await?;
        self.ensure_quiescent(&execution, "create_checkpoint")?;

        let capture = match rollback_data {
            Some(data) => RollbackCapture::Provided(data),
            None => RollbackCapture::FilesModified,
        };
        let checkpoint = self
            .checkpoints
            .create_with(execution_id, execution.current_step, description, false, capture)
            .await?;
        self.audit
            .info(
                execution_id,
                "checkpoint.created",
                json!({
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "step_number": checkpoint.step_number,
                    "automatic": false,
                }),
            )
            .await;
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(
        &self,
        execution_id: ExecutionId,
        caller: UserId,
    ) -> VigilResult<Vec<Checkpoint>> {
        self.load_owned(execution_id, caller).await?;
        self.checkpoints.list(execution_id).await
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub async fn get_state(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<ExecutionView> {
        let execution = self.load_owned(execution_id, caller).await?;
        let steps = self.store.step_list(execution_id).await?;
        Ok(ExecutionView { execution, steps })
    }

    pub async fn list_executions(&self, caller: UserId) -> VigilResult<Vec<AgentExecution>> {
        self.store.execution_list_by_user(caller).await
    }

    pub async fn audit_trail(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<Vec<AuditEntry>> {
        self.load_owned(execution_id, caller).await?;
        self.audit.trail(execution_id).await
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn dispatch(&self, execution: AgentExecution) -> VigilResult<AgentExecution> {
        let execution_id = execution.execution_id;
        match self.dispatch_mode {
            DispatchMode::Inline => match self.scheduler.run(execution_id).await? {
                RunReport::Stopped { execution, .. } => {
                    if execution.is_terminal() {
                        self.locks.forget(execution_id);
                    }
                    Ok(execution)
                }
                RunReport::AlreadyRunning => Ok(execution),
            },
            DispatchMode::Spawn => {
                let scheduler = Arc::clone(&self.scheduler);
                let audit = self.audit.clone();
                tokio::spawn(async move {
                    if let Err(err) = scheduler.run(execution_id).await {
                        tracing::error!(execution_id = %execution_id, error = %err, "step loop failed");
                        audit
                            .error(
                                Some(execution_id),
                                "execution.loop_error",
                                json!({"kind": err.kind(), "error": err.to_string()}),
                            )
                            .await;
                    }
                });
                Ok(execution)
            }
        }
    }

    /// No step may be running: not `executing`, and no loop finishing a call.
    fn ensure_quiescent(&self, execution: &AgentExecution, operation: &str) -> VigilResult<()> {
        if execution.state.is_executing() {
            return Err(VigilError::invalid_transition(
                execution.execution_id,
                operation,
                &execution.state,
            ));
        }
        if self.locks.loop_active(execution.execution_id) {
            return Err(VigilError::invalid_transition(
                execution.execution_id,
                operation,
                format!("{} with a step in flight", execution.state),
            ));
        }
        Ok(())
    }

    async fn load_owned(&self, execution_id: ExecutionId, caller: UserId) -> VigilResult<AgentExecution> {
        let execution = self
            .store
            .execution_get(execution_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Execution, execution_id))?;
        if execution.user_id != caller {
            return Err(VigilError::forbidden(EntityType::Execution, execution_id, caller));
        }
        Ok(execution)
    }

    async fn load_step(&self, execution_id: ExecutionId, step_number: u32) -> VigilResult<ExecutionStep> {
        self.store
            .step_get(execution_id, step_number)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Step, execution_id))
    }

    async fn load_agent(&self, execution: &AgentExecution) -> VigilResult<Agent> {
        self.store
            .agent_get(execution.agent_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Agent, execution.agent_id))
    }
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("dispatch_mode", &self.dispatch_mode)
            .finish_non_exhaustive()
    }
}
