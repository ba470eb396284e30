//! Step Scheduler
//!
//! Advances one execution one step at a time. Each iteration runs in three
//! phases:
//!
//! 1. Under the execution lock: reload the execution, stop unless it is
//!    `executing`, then apply the pre-dispatch gates in order (step cap,
//!    per-execution budget, account budget, safety). A step that passes is
//!    persisted as `running` before the lock is released.
//! 2. Without the lock: call the tool. `pause` and `halt` stay responsive
//!    while a call is in flight; they take effect before the next step.
//! 3. Under the lock again: record usage, then the step result, then the
//!    automatic checkpoint. A usage or checkpoint failure fails the
//!    execution; nothing is swallowed.
//!
//! There are no retries here. Wrap the invoker in `RetryingInvoker` to get
//! them.

use crate::audit::AuditLog;
use crate::budget::{BudgetLedger, NewUsage};
use crate::locks::{ExecutionLocks, LoopClaim};
use crate::planner::{PlannedStep, PlanningContext, StepPlanner};
use crate::safety::SafetyGate;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use vigil_checkpoint::CheckpointManager;
use vigil_core::{
    Agent, AgentExecution, EngineConfig, EntityType, ErrorKind, ExecutionError, ExecutionId,
    ExecutionState, ExecutionStep, Payload, StepAction, StepNumber, StepStatus, ToolError, Usd,
    VigilError, VigilResult,
};
use vigil_storage::ExecutionStore;
use vigil_tools::{InvokeOptions, Message, PricingTable, ToolRegistry, ToolResponse};

/// How a call to [`StepScheduler::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    /// Another loop already owns the execution.
    AlreadyRunning,
    /// The loop reached a state it cannot advance.
    Stopped {
        execution: AgentExecution,
        steps_dispatched: u32,
    },
}

/// Result of the locked pre-dispatch phase.
enum Prepared {
    Stop(AgentExecution),
    Dispatch {
        execution: AgentExecution,
        step: ExecutionStep,
    },
}

pub struct StepScheduler {
    store: Arc<dyn ExecutionStore>,
    tools: Arc<ToolRegistry>,
    planner: Arc<dyn StepPlanner>,
    ledger: BudgetLedger,
    checkpoints: CheckpointManager,
    audit: AuditLog,
    locks: Arc<ExecutionLocks>,
    pricing: PricingTable,
    config: EngineConfig,
}

#[allow(clippy::too_many_arguments)]
impl StepScheduler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        tools: Arc<ToolRegistry>,
        planner: Arc<dyn StepPlanner>,
        ledger: BudgetLedger,
        checkpoints: CheckpointManager,
        audit: AuditLog,
        locks: Arc<ExecutionLocks>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pricing: PricingTable::new(config.pricing.clone()),
            store,
            tools,
            planner,
            ledger,
            checkpoints,
            audit,
            locks,
            config,
        }
    }

    /// Drive an execution until it stops being `executing`.
    pub async fn run(&self, execution_id: ExecutionId) -> VigilResult<RunReport> {
        let Some(mut claim) = self.locks.try_claim_loop(execution_id) else {
            tracing::debug!(execution_id = %execution_id, "step loop already running");
            return Ok(RunReport::AlreadyRunning);
        };

        let mut steps_dispatched = 0u32;
        loop {
            let (execution, step) = match self.prepare(execution_id, &mut claim).await? {
                Prepared::Stop(execution) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        state = %execution.state,
                        steps_dispatched,
                        "step loop stopped"
                    );
                    return Ok(RunReport::Stopped {
                        execution,
                        steps_dispatched,
                    });
                }
                Prepared::Dispatch { execution, step } => (execution, step),
            };

            steps_dispatched += 1;
            let started = Instant::now();
            let result = self.invoke(&execution, &step).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            self.settle(execution_id, step.step_number, result, duration_ms)
                .await?;
        }
    }

    // ========================================================================
    // PHASE 1: PRE-DISPATCH
    // ========================================================================

    async fn prepare(
        &self,
        execution_id: ExecutionId,
        claim: &mut LoopClaim,
    ) -> VigilResult<Prepared> {
        let _guard = self.locks.lock(execution_id).await;

        let mut execution = self.load_execution(execution_id).await?;
        if !execution.state.is_executing() {
            claim.release();
            return Ok(Prepared::Stop(execution));
        }

        match self.gate(&mut execution).await {
            Ok(prepared) => {
                if let Prepared::Stop(_) = prepared {
                    claim.release();
                }
                Ok(prepared)
            }
            Err(err) => {
                let current = self.load_execution(execution_id).await?;
                let failed = self.fail_execution(current, &err, "pre-dispatch").await;
                claim.release();
                failed.map(Prepared::Stop)
            }
        }
    }

    async fn gate(&self, execution: &mut AgentExecution) -> VigilResult<Prepared> {
        let execution_id = execution.execution_id;
        let agent = self.load_agent(execution).await?;
        let policy = &agent.policy;
        let steps = self.store.step_list(execution_id).await?;

        // A call that failed while the execution was paused fails it now.
        if let Some(ExecutionStep {
            step_number,
            status: StepStatus::Failed { error, .. },
            ..
        }) = steps.last()
        {
            return self.fail_deferred(execution, *step_number, error).await;
        }

        // An approved step resumes without a second safety check.
        let approved = steps
            .last()
            .filter(|s| matches!(s.status, StepStatus::Pending { approved: true }))
            .cloned();

        if execution.current_step >= policy.max_steps {
            return self
                .halt(
                    execution.clone(),
                    ExecutionError::MaxStepsReached {
                        max_steps: policy.max_steps,
                    },
                    approved.map(|s| skip(s, "step limit reached")),
                )
                .await;
        }

        let action = match &approved {
            Some(step) => step.action.clone(),
            None => {
                let ctx = PlanningContext {
                    execution: &*execution,
                    steps: &steps,
                    policy,
                };
                let planned = self.planner.next_action(&ctx).await?;
                match planned {
                    PlannedStep::Action(action) => action,
                    PlannedStep::Done => {
                        execution.complete();
                        let completed = self.store.execution_update(execution).await?;
                        self.audit
                            .info(
                                execution_id,
                                "execution.completed",
                                json!({"current_step": completed.current_step, "by": "planner"}),
                            )
                            .await;
                        return Ok(Prepared::Stop(completed));
                    }
                }
            }
        };

        let estimated_cost = action.estimated_cost.unwrap_or(Usd::ZERO);
        let estimated_tokens = action.estimated_tokens.unwrap_or(0);
        let breach = match self
            .ledger
            .check_execution_cap(execution, policy, estimated_cost, estimated_tokens)
            .await?
        {
            Some(breach) => Some(breach),
            None => {
                self.ledger
                    .check_account_cap(execution.user_id, estimated_cost, estimated_tokens, Utc::now())
                    .await?
            }
        };
        if let Some(breach) = breach {
            tracing::warn!(execution_id = %execution_id, %breach, "dispatch refused");
            return self
                .halt(
                    execution.clone(),
                    breach.into_error(),
                    approved.map(|s| skip(s, "budget exhausted")),
                )
                .await;
        }

        let mut step = match approved {
            Some(step) => step,
            None => {
                let verdict = SafetyGate::evaluate(&action, policy);
                let mut step =
                    ExecutionStep::new(execution_id, execution.next_step_number(), action);
                step.requires_confirmation = verdict.requires_confirmation;
                execution.total_steps += 1;

                if !verdict.allowed {
                    step.set_status(StepStatus::Failed {
                        error: verdict.reason.clone(),
                        failed_at: Utc::now(),
                    });
                    self.audit
                        .warn(
                            execution_id,
                            "step.blocked",
                            json!({
                                "step_number": step.step_number,
                                "reason": verdict.reason,
                                "risk_level": verdict.risk_level,
                                "rule": verdict.matched_rule,
                            }),
                        )
                        .await;
                    return self
                        .halt(
                            execution.clone(),
                            ExecutionError::SafetyBlocked {
                                reason: verdict.reason,
                            },
                            Some(step),
                        )
                        .await;
                }

                if verdict.requires_confirmation {
                    step.set_status(StepStatus::AwaitingConfirmation {
                        reason: verdict.reason.clone(),
                        risk_level: verdict.risk_level,
                    });
                    execution.set_state(ExecutionState::AwaitingConfirmation {
                        step_number: step.step_number,
                        reason: verdict.reason.clone(),
                        risk_level: verdict.risk_level,
                    });
                    let suspended = self.store.execution_commit(execution, &[step.clone()]).await?;
                    self.audit
                        .info(
                            execution_id,
                            "step.awaiting_confirmation",
                            json!({
                                "step_number": step.step_number,
                                "reason": verdict.reason,
                                "risk_level": verdict.risk_level,
                            }),
                        )
                        .await;
                    return Ok(Prepared::Stop(suspended));
                }
                step
            }
        };

        step.set_status(StepStatus::Running {
            started_at: Utc::now(),
        });
        let execution = self.store.execution_commit(execution, &[step.clone()]).await?;
        tracing::info!(
            execution_id = %execution_id,
            step_number = step.step_number,
            tool = %step.action.tool,
            "dispatching step"
        );
        Ok(Prepared::Dispatch { execution, step })
    }

    /// Halt on a refused dispatch. Errors that carry no halt reason are
    /// returned instead.
    async fn halt(
        &self,
        mut execution: AgentExecution,
        refusal: ExecutionError,
        step: Option<ExecutionStep>,
    ) -> VigilResult<Prepared> {
        let Some(reason) = refusal.halt_reason() else {
            return Err(refusal.into());
        };
        let execution_id = execution.execution_id;
        let message = refusal.to_string();
        execution.halt(reason, message.clone());
        let steps: Vec<ExecutionStep> = step.into_iter().collect();
        let halted = self.store.execution_commit(&execution, &steps).await?;
        self.audit
            .warn(
                execution_id,
                "execution.halted",
                json!({
                    "reason": reason,
                    "kind": VigilError::from(refusal).kind(),
                    "message": message,
                    "current_step": halted.current_step,
                }),
            )
            .await;
        Ok(Prepared::Stop(halted))
    }

    /// Fail an execution resumed after its last call failed.
    async fn fail_deferred(
        &self,
        execution: &mut AgentExecution,
        step_number: StepNumber,
        error: &str,
    ) -> VigilResult<Prepared> {
        execution.fail(
            ErrorKind::ToolInvocationError.as_str(),
            format!("step {} failed: {}", step_number, error),
        );
        let failed = self.store.execution_update(execution).await?;
        self.audit
            .error(
                Some(execution.execution_id),
                "execution.failed",
                json!({
                    "step_number": step_number,
                    "error": error,
                    "deferred": true,
                }),
            )
            .await;
        Ok(Prepared::Stop(failed))
    }

    // ========================================================================
    // PHASE 2: INVOCATION
    // ========================================================================

    async fn invoke(
        &self,
        execution: &AgentExecution,
        step: &ExecutionStep,
    ) -> Result<ToolResponse, ToolError> {
        let invoker = self.tools.resolve(&step.action.tool)?;
        let messages = build_messages(execution, &step.action);
        let options = InvokeOptions::new(
            step.action.tool.clone(),
            self.config.default_model.clone(),
            self.config.max_tokens,
        )
        .with_metadata(json!({
            "execution_id": execution.execution_id,
            "step_number": step.step_number,
        }));
        invoker.invoke(&messages, &options).await
    }

    // ========================================================================
    // PHASE 3: SETTLEMENT
    // ========================================================================

    async fn settle(
        &self,
        execution_id: ExecutionId,
        step_number: StepNumber,
        result: Result<ToolResponse, ToolError>,
        duration_ms: u64,
    ) -> VigilResult<()> {
        let _guard = self.locks.lock(execution_id).await;

        let mut execution = self.load_execution(execution_id).await?;
        let mut step = self
            .store
            .step_get(execution_id, step_number)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Step, execution_id))?;
        step.duration_ms = Some(duration_ms);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                step.set_status(StepStatus::Failed {
                    error: err.to_string(),
                    failed_at: Utc::now(),
                });
                // A paused execution fails on resume instead.
                let deferred = !execution.state.is_executing();
                if !deferred {
                    execution.fail(ErrorKind::ToolInvocationError.as_str(), err.to_string());
                }
                self.store.execution_commit(&execution, &[step]).await?;
                self.audit
                    .error(
                        Some(execution_id),
                        "step.failed",
                        json!({
                            "step_number": step_number,
                            "error": err.to_string(),
                            "retryable": err.is_retryable(),
                            "deferred": deferred,
                        }),
                    )
                    .await;
                return Ok(());
            }
        };

        let tokens = response.usage.total();
        let cost = self.pricing.cost_of(&self.config.default_model, &response);
        let usage = NewUsage::new(
            execution.user_id,
            tokens,
            cost,
            self.config.default_model.clone(),
            step.action.tool.clone(),
        )
        .for_step(execution_id, step_number);
        if let Err(err) = self.ledger.record_usage(usage).await {
            step.set_status(StepStatus::Failed {
                error: format!("usage ledger append failed: {}", err),
                failed_at: Utc::now(),
            });
            let failed = self.store.execution_commit(&execution, &[step]).await?;
            self.fail_execution(failed, &err, "usage").await?;
            return Ok(());
        }

        let output = response.content;
        step.output = Some(Payload::text(output.clone()));
        step.tokens_used = Some(tokens);
        step.cost = Some(cost);
        step.set_status(StepStatus::Complete {
            completed_at: Utc::now(),
        });
        execution.current_step += 1;
        execution.record_files_modified(response.files_modified);

        let matched = matched_stopping_condition(&execution.stopping_conditions, &output);
        if let (Some(condition), true) = (&matched, execution.state.is_executing()) {
            tracing::info!(execution_id = %execution_id, condition = %condition, "stopping condition met");
            execution.complete();
        }

        let execution = self.store.execution_commit(&execution, &[step]).await?;
        self.audit
            .info(
                execution_id,
                "step.completed",
                json!({
                    "step_number": step_number,
                    "duration_ms": duration_ms,
                    "tokens": tokens,
                    "cost": cost,
                    "stopping_condition": matched,
                }),
            )
            .await;

        self.auto_checkpoint(execution).await
    }

    async fn auto_checkpoint(&self, execution: AgentExecution) -> VigilResult<()> {
        let agent = self.load_agent(&execution).await?;
        let interval = self.config.checkpoint_interval.max(1);
        if !agent.policy.auto_checkpoint || execution.current_step % interval != 0 {
            return Ok(());
        }

        let description = format!("After step {}", execution.current_step);
        if let Err(err) = self
            .checkpoints
            .create(execution.execution_id, execution.current_step, Some(description), true)
            .await
        {
            let current = self.load_execution(execution.execution_id).await?;
            self.fail_execution(current, &err, "checkpoint").await?;
        }
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Fail a live execution after an internal error. Terminal executions
    /// are left alone.
    async fn fail_execution(
        &self,
        mut execution: AgentExecution,
        err: &VigilError,
        phase: &str,
    ) -> VigilResult<AgentExecution> {
        let execution_id = execution.execution_id;
        self.audit
            .error(
                Some(execution_id),
                "execution.internal_error",
                json!({"phase": phase, "kind": err.kind(), "error": err.to_string()}),
            )
            .await;
        if execution.is_terminal() {
            return Ok(execution);
        }
        execution.fail(err.kind().as_str(), format!("{} failed: {}", phase, err));
        self.store.execution_update(&execution).await
    }

    async fn load_execution(&self, execution_id: ExecutionId) -> VigilResult<AgentExecution> {
        self.store
            .execution_get(execution_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Execution, execution_id))
    }

    async fn load_agent(&self, execution: &AgentExecution) -> VigilResult<Agent> {
        self.store
            .agent_get(execution.agent_id)
            .await?
            .ok_or_else(|| VigilError::not_found(EntityType::Agent, execution.agent_id))
    }
}

impl std::fmt::Debug for StepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScheduler")
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn skip(mut step: ExecutionStep, reason: &str) -> ExecutionStep {
    step.set_status(StepStatus::Skipped {
        reason: reason.to_string(),
    });
    step
}

/// Goal and assumptions as the system message, the action as the user
/// message.
fn build_messages(execution: &AgentExecution, action: &StepAction) -> Vec<Message> {
    let mut system = format!("Goal: {}", execution.goal);
    for assumption in &execution.assumptions {
        system.push_str("\nAssumption: ");
        system.push_str(assumption);
    }
    let mut user = action.description.clone();
    if let Some(input) = action.input.as_text().filter(|t| !t.is_empty()) {
        user.push_str("\n\n");
        user.push_str(input);
    }
    vec![Message::system(system), Message::user(user)]
}

/// First stopping condition found in `output`, compared case-insensitively.
fn matched_stopping_condition(conditions: &[String], output: &str) -> Option<String> {
    let lowered = output.to_lowercase();
    conditions
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty() && lowered.contains(&c.to_lowercase()))
        .map(str::to_string)
}
