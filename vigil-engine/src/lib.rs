//! VIGIL Engine - Supervised Agent Execution
//!
//! Drives an agent toward a goal one step at a time, under a safety gate,
//! budget caps and a confirmation gate, with checkpoints to rewind to.
//!
//! - [`safety`] classifies a proposed action as allow / confirm / deny.
//! - [`budget`] records usage and checks per-execution and account caps.
//! - [`scheduler`] runs the step loop: plan, gate, invoke, record.
//! - [`controller`] owns the execution state machine.
//! - [`control`] is the external surface, with structured errors.
//! - [`audit`] keeps the diagnostic trail.
//!
//! Wire everything together with [`EngineBuilder`]:
//!
//! ```ignore
//! let engine = EngineBuilder::new(store, files)
//!     .with_default_tool(Arc::new(invoker))
//!     .build()?;
//! let execution = engine.control.start(user_id, StartExecution::new(agent_id, "goal")).await?;
//! ```

pub mod audit;
pub mod budget;
pub mod control;
pub mod controller;
pub mod locks;
pub mod planner;
pub mod safety;
pub mod scheduler;

pub use audit::{AuditLog, AuditSink, InMemoryAuditSink};
pub use budget::{BudgetBreach, BudgetLedger, NewUsage, UsageScope, UsageTotals};
pub use control::{ControlApi, ControlError, ControlResult};
pub use controller::{ExecutionController, ExecutionView, StartExecution};
pub use locks::{ExecutionLocks, LoopClaim};
pub use planner::{ContextPlanner, PlannedStep, PlanningContext, StepPlanner, PLAN_CONTEXT_KEY};
pub use safety::{check, RuleSet, SafetyGate};
pub use scheduler::{RunReport, StepScheduler};

use std::sync::Arc;
use uuid::Uuid;
use vigil_checkpoint::CheckpointManager;
use vigil_core::{EngineConfig, VigilResult};
use vigil_storage::{ExecutionStore, FileStore};
use vigil_tools::{ToolInvoker, ToolRegistry};

// ============================================================================
// ENGINE ASSEMBLY
// ============================================================================

/// Assembled engine. Every component shares one store and one lock table.
#[derive(Debug, Clone)]
pub struct Engine {
    pub control: ControlApi,
    pub controller: Arc<ExecutionController>,
    pub ledger: BudgetLedger,
    pub checkpoints: CheckpointManager,
    pub audit: AuditLog,
    pub config: EngineConfig,
}

pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    files: Arc<dyn FileStore>,
    tools: ToolRegistry,
    planner: Arc<dyn StepPlanner>,
    audit_sink: Arc<dyn AuditSink>,
    session_id: Option<Uuid>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Defaults: no tools, [`ContextPlanner`], in-memory audit sink and
    /// [`EngineConfig::default_engine`].
    pub fn new(store: Arc<dyn ExecutionStore>, files: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            files,
            tools: ToolRegistry::new(),
            planner: Arc::new(ContextPlanner),
            audit_sink: Arc::new(InMemoryAuditSink::new()),
            session_id: None,
            config: EngineConfig::default_engine(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Route every tool name without its own invoker to `invoker`.
    pub fn with_default_tool(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.tools.set_default(invoker);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.tools.register(tool, invoker);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn StepPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> VigilResult<Engine> {
        self.config.validate()?;

        let mut audit = AuditLog::new(self.audit_sink, self.config.audit_min_level);
        if let Some(session_id) = self.session_id {
            audit = audit.with_session(session_id);
        }
        let locks = Arc::new(ExecutionLocks::new());
        let ledger = BudgetLedger::new(Arc::clone(&self.store));
        let checkpoints = CheckpointManager::new(Arc::clone(&self.store), self.files);

        let scheduler = Arc::new(StepScheduler::new(
            Arc::clone(&self.store),
            Arc::new(self.tools),
            self.planner,
            ledger.clone(),
            checkpoints.clone(),
            audit.clone(),
            Arc::clone(&locks),
            self.config.clone(),
        ));
        let controller = Arc::new(ExecutionController::new(
            self.store,
            scheduler,
            checkpoints.clone(),
            audit.clone(),
            locks,
            self.config.dispatch_mode,
        ));
        let control = ControlApi::new(Arc::clone(&controller), ledger.clone(), audit.clone());

        tracing::debug!(
            dispatch_mode = %self.config.dispatch_mode,
            checkpoint_interval = self.config.checkpoint_interval,
            "engine assembled"
        );
        Ok(Engine {
            control,
            controller,
            ledger,
            checkpoints,
            audit,
            config: self.config,
        })
    }
}
