//! Shared engine harness for integration tests.
//!
//! Builds an engine over in-memory stores with a scripted mock invoker.
//! Both the file store and the execution store can be told to fail.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use vigil_core::{
    Agent, AgentExecution, AgentPolicy, DispatchMode, EngineConfig, ExecutionStep, StepAction,
    UserId,
};
use vigil_engine::{ControlResult, Engine, EngineBuilder, ExecutionView, InMemoryAuditSink, StartExecution};
use vigil_storage::ExecutionStore;
use vigil_tools::ToolInvoker;
use vigil_test_utils::fixtures::make_agent;
use vigil_test_utils::{
    FailingFileStore, FailingStore, InMemoryFileStore, InMemoryStore, MockToolInvoker,
};

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    /// The store the engine writes through.
    pub faults: Arc<FailingStore>,
    pub files: Arc<InMemoryFileStore>,
    pub failing: Arc<FailingFileStore>,
    pub invoker: MockToolInvoker,
    pub audit: InMemoryAuditSink,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default_engine())
    }

    pub fn spawned() -> Self {
        Self::with_config(EngineConfig::default_engine().with_dispatch_mode(DispatchMode::Spawn))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_tools(config, Vec::new())
    }

    /// Extra invokers registered by tool name next to the mock default.
    pub fn with_tools(config: EngineConfig, tools: Vec<(&str, Arc<dyn ToolInvoker>)>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let faults = Arc::new(FailingStore::new(store.clone()));
        let files = Arc::new(InMemoryFileStore::new());
        let failing = Arc::new(FailingFileStore::new(files.clone()));
        let invoker = MockToolInvoker::new("llm");
        let audit = InMemoryAuditSink::new();
        let mut builder = EngineBuilder::new(faults.clone(), failing.clone())
            .with_default_tool(Arc::new(invoker.clone()))
            .with_audit_sink(Arc::new(audit.clone()))
            .with_config(config);
        for (name, tool) in tools {
            builder = builder.with_tool(name, tool);
        }
        let engine = builder
            .build()
            .expect("engine config is valid");
        Self {
            store,
            faults,
            files,
            failing,
            invoker,
            audit,
            engine,
        }
    }

    /// Insert an agent with the given policy.
    pub async fn agent(&self, policy: AgentPolicy) -> Agent {
        let agent = make_agent(policy);
        self.store.agent_insert(&agent).await.expect("insert agent");
        agent
    }

    pub async fn start(&self, agent: &Agent, plan: &[StepAction]) -> ControlResult<AgentExecution> {
        self.engine
            .control
            .start(
                agent.owner_user_id,
                StartExecution::new(agent.agent_id, "ship the feature").with_plan(plan),
            )
            .await
    }

    pub async fn view(&self, caller: UserId, execution: &AgentExecution) -> ExecutionView {
        self.engine
            .control
            .get_state(caller, execution.execution_id)
            .await
            .expect("execution is readable by its owner")
    }

    pub async fn steps(&self, execution: &AgentExecution) -> Vec<ExecutionStep> {
        self.store
            .step_list(execution.execution_id)
            .await
            .expect("list steps")
    }

    /// Poll until the execution leaves `executing` and no loop owns it.
    pub async fn settled(&self, caller: UserId, execution: &AgentExecution) -> AgentExecution {
        for _ in 0..400 {
            let view = self.view(caller, execution).await;
            let idle = !self
                .engine
                .controller
                .is_loop_active(execution.execution_id);
            if !view.execution.state.is_executing() && idle {
                return view.execution;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {} never settled", execution.execution_id);
    }
}

/// Action for the default tool.
pub fn llm(description: &str) -> StepAction {
    StepAction::new("llm", description)
}

/// `n` harmless actions.
pub fn plan_of(n: usize) -> Vec<StepAction> {
    (1..=n).map(|i| llm(&format!("write section {}", i))).collect()
}
