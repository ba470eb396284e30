//! Entity types for the execution engine

use crate::{
    content_hash_hex, new_entity_id, AgentId, AgentPolicy, AuditLevel, CheckpointId,
    ExecutionId, ExecutionState, FileAction, HaltReason, ProjectId, StepNumber, StepStatus,
    Timestamp, Usd, UserId, ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Free-form context attached to an execution and copied into checkpoints.
pub type ContextMap = BTreeMap<String, Value>;

// ============================================================================
// PAYLOAD
// ============================================================================

/// Opaque step input/output: raw bytes plus a declared content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PayloadRepr", into = "PayloadRepr")]
pub struct Payload {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            data,
        }
    }

    pub fn empty() -> Self {
        Self::new(CONTENT_TYPE_BINARY, Vec::new())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(CONTENT_TYPE_TEXT, text.into().into_bytes())
    }

    pub fn json(value: &Value) -> Self {
        Self::new(CONTENT_TYPE_JSON, value.to_string().into_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_json(&self) -> bool {
        self.content_type == CONTENT_TYPE_JSON
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn to_json(&self) -> Result<Value, ValidationError> {
        serde_json::from_slice(&self.data).map_err(|e| ValidationError::PayloadDecode {
            content_type: self.content_type.clone(),
            reason: e.to_string(),
        })
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

/// Wire form: JSON payloads are inlined, text stays text, everything else is hex.
#[derive(Serialize, Deserialize)]
struct PayloadRepr {
    content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hex: Option<String>,
}

impl From<Payload> for PayloadRepr {
    fn from(p: Payload) -> Self {
        let mut repr = PayloadRepr {
            content_type: p.content_type.clone(),
            json: None,
            text: None,
            hex: None,
        };
        if p.is_json() {
            if let Ok(value) = serde_json::from_slice::<Value>(&p.data) {
                repr.json = Some(value);
                return repr;
            }
        }
        match String::from_utf8(p.data) {
            Ok(text) if p.content_type.starts_with("text/") || p.content_type == CONTENT_TYPE_JSON => {
                repr.text = Some(text)
            }
            Ok(text) => repr.hex = Some(hex::encode(text.as_bytes())),
            Err(e) => repr.hex = Some(hex::encode(e.into_bytes())),
        }
        repr
    }
}

impl TryFrom<PayloadRepr> for Payload {
    type Error = String;

    fn try_from(repr: PayloadRepr) -> Result<Self, Self::Error> {
        let data = match (repr.json, repr.text, repr.hex) {
            (Some(value), None, None) => value.to_string().into_bytes(),
            (None, Some(text), None) => text.into_bytes(),
            (None, None, Some(encoded)) => {
                hex::decode(&encoded).map_err(|e| format!("invalid hex payload: {}", e))?
            }
            (None, None, None) => Vec::new(),
            _ => return Err("payload must set at most one of json, text, hex".to_string()),
        };
        Ok(Payload {
            content_type: repr.content_type,
            data,
        })
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// An agent definition: who owns it, where it works, and its policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub owner_user_id: UserId,
    pub project_id: ProjectId,
    pub name: String,
    pub enabled: bool,
    pub policy: AgentPolicy,
    pub created_at: Timestamp,
}

impl Agent {
    pub fn new(
        owner_user_id: UserId,
        project_id: ProjectId,
        name: impl Into<String>,
        policy: AgentPolicy,
    ) -> Self {
        Self {
            agent_id: new_entity_id(),
            owner_user_id,
            project_id,
            name: name.into(),
            enabled: true,
            policy,
            created_at: Utc::now(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// STEP ACTION
// ============================================================================

/// Descriptor of the work a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    /// Tool or model operation name, e.g. `"llm.complete"` or `"shell"`.
    pub tool: String,
    /// Text the safety gate evaluates.
    pub description: String,
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub modifies_files: bool,
    #[serde(default)]
    pub expands_scope: bool,
    /// Planner-reported uncertainty in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<Usd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
}

impl StepAction {
    pub fn new(tool: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            description: description.into(),
            input: Payload::empty(),
            modifies_files: false,
            expands_scope: false,
            uncertainty: None,
            estimated_cost: None,
            estimated_tokens: None,
        }
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    pub fn with_modifies_files(mut self, modifies: bool) -> Self {
        self.modifies_files = modifies;
        self
    }

    pub fn with_expands_scope(mut self, expands: bool) -> Self {
        self.expands_scope = expands;
        self
    }

    pub fn with_uncertainty(mut self, uncertainty: f64) -> Self {
        self.uncertainty = Some(uncertainty);
        self
    }

    pub fn with_estimated_cost(mut self, cost: Usd) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

/// One run of an agent toward a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub goal: String,
    pub assumptions: Vec<String>,
    pub stopping_conditions: Vec<String>,
    pub state: ExecutionState,
    /// Number of successfully completed steps.
    pub current_step: StepNumber,
    /// Number of step records created.
    pub total_steps: StepNumber,
    pub context: ContextMap,
    pub files_modified: Vec<String>,
    /// Highest step number ever issued. Not restored by rollback, so numbers
    /// are never reused.
    pub last_step_number: StepNumber,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    /// Bumped on every persisted write; used for compare-and-swap.
    pub version: u64,
}

impl AgentExecution {
    /// New execution in `planning`, owned by the agent's owner.
    pub fn new(agent: &Agent, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: new_entity_id(),
            agent_id: agent.agent_id,
            user_id: agent.owner_user_id,
            project_id: agent.project_id,
            goal: goal.into(),
            assumptions: Vec::new(),
            stopping_conditions: Vec::new(),
            state: ExecutionState::Planning,
            current_step: 0,
            total_steps: 0,
            context: ContextMap::new(),
            files_modified: Vec::new(),
            last_step_number: 0,
            started_at: now,
            updated_at: now,
            version: 0,
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

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.state.completed_at()
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.state.halt_reason()
    }

    pub fn halt_message(&self) -> Option<&str> {
        self.state.halt_message()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Issue the next step number.
    pub fn next_step_number(&mut self) -> StepNumber {
        self.last_step_number += 1;
        self.last_step_number
    }

    /// Record paths touched by a step, keeping first-seen order.
    pub fn record_files_modified<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if !self.files_modified.contains(&path) {
                self.files_modified.push(path);
            }
        }
    }

    pub fn set_state(&mut self, state: ExecutionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn halt(&mut self, reason: HaltReason, message: impl Into<String>) {
        self.set_state(ExecutionState::Halted {
            reason,
            message: message.into(),
            halted_at: Utc::now(),
        });
    }

    pub fn fail(&mut self, error_kind: impl Into<String>, message: impl Into<String>) {
        self.set_state(ExecutionState::Failed {
            error_kind: error_kind.into(),
            message: message.into(),
            failed_at: Utc::now(),
        });
    }

    pub fn complete(&mut self) {
        self.set_state(ExecutionState::Completed {
            completed_at: Utc::now(),
        });
    }
}

/// One discrete unit of work within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub execution_id: ExecutionId,
    pub step_number: StepNumber,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Usd>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ExecutionStep {
    pub fn new(execution_id: ExecutionId, step_number: StepNumber, action: StepAction) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            step_number,
            action,
            output: None,
            status: StepStatus::Pending { approved: false },
            duration_ms: None,
            requires_confirmation: false,
            tokens_used: None,
            cost: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.status.error()
    }

    pub fn set_status(&mut self, status: StepStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// CHECKPOINT
// ============================================================================

/// Value copy of the restorable parts of an execution.
///
/// Owned data only: building one from a live execution clones every field, so
/// later mutation of the execution can never reach into a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub state: ExecutionState,
    pub current_step: StepNumber,
    pub total_steps: StepNumber,
    pub steps: Vec<ExecutionStep>,
    pub context: ContextMap,
    pub files_modified: Vec<String>,
}

impl CheckpointSnapshot {
    pub fn capture(execution: &AgentExecution, steps: &[ExecutionStep]) -> Self {
        Self {
            state: execution.state.clone(),
            current_step: execution.current_step,
            total_steps: execution.total_steps,
            steps: steps.to_vec(),
            context: execution.context.clone(),
            files_modified: execution.files_modified.clone(),
        }
    }

    /// Execution record as it should look after restoring this snapshot.
    ///
    /// Identity, ownership, goal and the step-number high-water mark stay as
    /// they are on `current`.
    pub fn restore_onto(&self, current: &AgentExecution) -> AgentExecution {
        let mut restored = current.clone();
        restored.state = self.state.clone();
        restored.current_step = self.current_step;
        restored.total_steps = self.total_steps;
        restored.context = self.context.clone();
        restored.files_modified = self.files_modified.clone();
        restored.updated_at = Utc::now();
        restored
    }
}

/// Recorded content of one file for rollback replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub action: FileAction,
    /// Hex-encoded on the wire. `None` for `Delete`.
    #[serde(default, with = "hex_content", skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl FileSnapshot {
    pub fn write(path: impl Into<String>, content: Vec<u8>) -> Self {
        let hash = content_hash_hex(&content);
        Self {
            path: path.into(),
            action: FileAction::Write,
            content: Some(content),
            content_hash: Some(hash),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: None,
            content_hash: None,
        }
    }
}

mod hex_content {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| hex::decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Side effects to undo when restoring a checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RollbackData {
    #[serde(default)]
    pub file_snapshots: Vec<FileSnapshot>,
    /// Opaque records kept for diagnostics; never replayed.
    #[serde(default)]
    pub db_changes: Vec<Value>,
}

impl RollbackData {
    pub fn is_empty(&self) -> bool {
        self.file_snapshots.is_empty() && self.db_changes.is_empty()
    }
}

/// Immutable snapshot of one execution at a given step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub execution_id: ExecutionId,
    pub step_number: StepNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub automatic: bool,
    pub snapshot: CheckpointSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<RollbackData>,
    pub created_at: Timestamp,
}

// ============================================================================
// BUDGET
// ============================================================================

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsageRecord {
    pub record_id: Uuid,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<StepNumber>,
    pub tokens_used: u64,
    pub cost: Usd,
    pub model: String,
    pub operation: String,
    pub recorded_at: Timestamp,
}

/// Account-wide spending caps. Every limit is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserBudgetSettings {
    pub user_id: UserId,
    #[serde(default)]
    pub daily_limit_usd: Option<Usd>,
    #[serde(default)]
    pub monthly_limit_usd: Option<Usd>,
    #[serde(default)]
    pub daily_limit_tokens: Option<u64>,
    #[serde(default)]
    pub monthly_limit_tokens: Option<u64>,
}

impl UserBudgetSettings {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn with_daily_limit_usd(mut self, limit: Usd) -> Self {
        self.daily_limit_usd = Some(limit);
        self
    }

    pub fn with_monthly_limit_usd(mut self, limit: Usd) -> Self {
        self.monthly_limit_usd = Some(limit);
        self
    }

    pub fn with_daily_limit_tokens(mut self, limit: u64) -> Self {
        self.daily_limit_tokens = Some(limit);
        self
    }

    pub fn with_monthly_limit_tokens(mut self, limit: u64) -> Self {
        self.monthly_limit_tokens = Some(limit);
        self
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// Append-only diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub level: AuditLevel,
    pub event: String,
    pub payload: Value,
    pub created_at: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================
