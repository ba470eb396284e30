//! Next-action planning.
//!
//! The engine does not compose prompts or decide what to do next; a
//! [`StepPlanner`] does. [`ContextPlanner`] replays a plan stored in the
//! execution context.

use ::async_trait::async_trait;
use vigil_core::{
    AgentExecution, AgentPolicy, ExecutionStep, StepAction, ValidationError, VigilResult,
};

/// Context key holding a JSON array of step actions.
pub const PLAN_CONTEXT_KEY: &str = "plan";

/// Inputs to a planning decision.
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub execution: &'a AgentExecution,
    pub steps: &'a [ExecutionStep],
    pub policy: &'a AgentPolicy,
}

impl PlanningContext<'_> {
    /// Steps that completed or were skipped.
    pub fn settled_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_settled()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStep {
    Action(StepAction),
    /// Nothing left to do; the execution completes.
    Done,
}

#[async_trait]
pub trait StepPlanner: Send + Sync {
    async fn next_action(&self, ctx: &PlanningContext<'_>) -> VigilResult<PlannedStep>;
}

/// Replays `context["plan"]`, one entry per settled step.
///
/// The position is derived from persisted steps, so it survives pauses and
/// rollbacks without extra bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextPlanner;

impl ContextPlanner {
    pub fn plan_of(execution: &AgentExecution) -> VigilResult<Vec<StepAction>> {
        match execution.context.get(PLAN_CONTEXT_KEY) {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ValidationError::InvalidValue {
                    field: format!("context.{}", PLAN_CONTEXT_KEY),
                    reason: e.to_string(),
                }
                .into()
            }),
        }
    }
}

#[async_trait]
impl StepPlanner for ContextPlanner {
    async fn next_action(&self, ctx: &PlanningContext<'_>) -> VigilResult<PlannedStep> {
        let plan = Self::plan_of(ctx.execution)?;
        Ok(plan
            .into_iter()
            .nth(ctx.settled_steps())
            .map(PlannedStep::Action)
            .unwrap_or(PlannedStep::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use vigil_core::{ContextMap, ErrorKind, StepStatus};
    use vigil_test_utils::fixtures::{make_agent, make_execution};

    fn execution_with_plan(plan: serde_json::Value) -> AgentExecution {
        let agent = make_agent(AgentPolicy::default());
        let mut context = ContextMap::new();
        context.insert(PLAN_CONTEXT_KEY.to_string(), plan);
        make_execution(&agent).with_context(context)
    }

    #[tokio::test]
    async fn test_plan_position_follows_settled_steps() {
        let exec = execution_with_plan(json!([
            {"tool": "llm", "description": "first"},
            {"tool": "llm", "description": "second"}
        ]));
        let policy = AgentPolicy::default();
        let mut done = ExecutionStep::new(exec.execution_id, 1, StepAction::new("llm", "first"));
        done.set_status(StepStatus::Skipped {
            reason: "rejected".to_string(),
        });
        let mut failed = ExecutionStep::new(exec.execution_id, 2, StepAction::new("llm", "x"));
        failed.set_status(StepStatus::Failed {
            error: "e".to_string(),
            failed_at: Utc::now(),
        });
        let steps = vec![done, failed];

        let ctx = PlanningContext {
            execution: &exec,
            steps: &steps,
            policy: &policy,
        };
        match ContextPlanner.next_action(&ctx).await.unwrap() {
            PlannedStep::Action(action) => assert_eq!(action.description, "second"),
            PlannedStep::Done => panic!("expected an action"),
        }
    }

    #[tokio::test]
    async fn test_no_plan_is_done() {
        let agent = make_agent(AgentPolicy::default());
        let exec = make_execution(&agent);
        let policy = AgentPolicy::default();
        let ctx = PlanningContext {
            execution: &exec,
            steps: &[],
            policy: &policy,
        };
        assert_eq!(ContextPlanner.next_action(&ctx).await.unwrap(), PlannedStep::Done);
    }

    #[test]
    fn test_malformed_plan_is_validation_error() {
        let exec = execution_with_plan(json!({"not": "a list"}));
        let err = ContextPlanner::plan_of(&exec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
