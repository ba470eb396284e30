//! Enum types for VIGIL entities

use crate::{StepNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CORE ENUMS
// ============================================================================

/// Entity type discriminator used in errors and audit payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    Execution,
    Step,
    Checkpoint,
    UsageRecord,
    BudgetSettings,
    AuditEntry,
    File,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityType::Agent => "agent",
            EntityType::Execution => "execution",
            EntityType::Step => "step",
            EntityType::Checkpoint => "checkpoint",
            EntityType::UsageRecord => "usage_record",
            EntityType::BudgetSettings => "budget_settings",
            EntityType::AuditEntry => "audit_entry",
            EntityType::File => "file",
        };
        f.write_str(name)
    }
}

/// Risk attached to a safety decision. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(EnumParseError::new("risk level", s)),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for RiskLevel {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Kind of a safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Allow,
    Deny,
    Confirm,
}

impl RuleType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RuleType::Allow => "allow",
            RuleType::Deny => "deny",
            RuleType::Confirm => "confirm",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(RuleType::Allow),
            "deny" => Ok(RuleType::Deny),
            "confirm" => Ok(RuleType::Confirm),
            _ => Err(EnumParseError::new("rule type", s)),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for RuleType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Severity of an audit entry. Ordered so a minimum level can filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditLevel::Debug => "debug",
            AuditLevel::Info => "info",
            AuditLevel::Warn => "warn",
            AuditLevel::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(AuditLevel::Debug),
            "info" => Ok(AuditLevel::Info),
            "warn" | "warning" => Ok(AuditLevel::Warn),
            "error" => Ok(AuditLevel::Error),
            _ => Err(EnumParseError::new("audit level", s)),
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for AuditLevel {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// File operation recorded in a rollback snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Restore the file to the recorded content.
    Write,
    /// The file did not exist at capture time; remove it.
    Delete,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAction::Write => f.write_str("write"),
            FileAction::Delete => f.write_str("delete"),
        }
    }
}

/// What `reject` does with the execution after the pending step is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RejectAction {
    /// Fail the step and halt the execution with `user_rejected`.
    #[default]
    Halt,
    /// Skip the step and keep going.
    Skip,
}

/// Which cap stopped an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    ExecutionUsd,
    ExecutionTokens,
    AccountDaily,
    AccountMonthly,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BudgetScope::ExecutionUsd => "execution_usd",
            BudgetScope::ExecutionTokens => "execution_tokens",
            BudgetScope::AccountDaily => "account_daily",
            BudgetScope::AccountMonthly => "account_monthly",
        };
        f.write_str(name)
    }
}

// ============================================================================
// EXECUTION STATE MACHINE
// ============================================================================

/// Why an execution was halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    UserRequested,
    MaxStepsReached,
    BudgetExceeded { scope: BudgetScope },
    SafetyBlocked,
    UserRejected,
}

impl HaltReason {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            HaltReason::UserRequested => "user_requested",
            HaltReason::MaxStepsReached => "max_steps_reached",
            HaltReason::BudgetExceeded { .. } => "budget_exceeded",
            HaltReason::SafetyBlocked => "safety_blocked",
            HaltReason::UserRejected => "user_rejected",
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::BudgetExceeded { scope } => write!(f, "budget_exceeded ({})", scope),
            other => f.write_str(other.as_db_str()),
        }
    }
}

/// State of an agent execution.
///
/// Every variant carries exactly the data that is valid in that state, so a
/// halted execution always has a reason and a running one never has a
/// completion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    Planning,
    Executing,
    Paused {
        paused_at: Timestamp,
    },
    AwaitingConfirmation {
        step_number: StepNumber,
        reason: String,
        risk_level: RiskLevel,
    },
    Completed {
        completed_at: Timestamp,
    },
    Failed {
        error_kind: String,
        message: String,
        failed_at: Timestamp,
    },
    Halted {
        reason: HaltReason,
        message: String,
        halted_at: Timestamp,
    },
}

impl ExecutionState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExecutionState::Planning => "planning",
            ExecutionState::Executing => "executing",
            ExecutionState::Paused { .. } => "paused",
            ExecutionState::AwaitingConfirmation { .. } => "awaiting_confirmation",
            ExecutionState::Completed { .. } => "completed",
            ExecutionState::Failed { .. } => "failed",
            ExecutionState::Halted { .. } => "halted",
        }
    }

    /// Completed, failed and halted executions never change again
    /// (short of a rollback).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed { .. }
                | ExecutionState::Failed { .. }
                | ExecutionState::Halted { .. }
        )
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, ExecutionState::Executing)
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self {
            ExecutionState::Halted { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn halt_message(&self) -> Option<&str> {
        match self {
            ExecutionState::Halted { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Time the execution reached a terminal state.
    pub fn completed_at(&self) -> Option<Timestamp> {
        match self {
            ExecutionState::Completed { completed_at } => Some(*completed_at),
            ExecutionState::Failed { failed_at, .. } => Some(*failed_at),
            ExecutionState::Halted { halted_at, .. } => Some(*halted_at),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Status of a single execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// Created but not dispatched. `approved` is set once a user confirmed it.
    Pending { approved: bool },
    Running { started_at: Timestamp },
    AwaitingConfirmation { reason: String, risk_level: RiskLevel },
    Complete { completed_at: Timestamp },
    Failed { error: String, failed_at: Timestamp },
    Skipped { reason: String },
}

impl StepStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            StepStatus::Pending { .. } => "pending",
            StepStatus::Running { .. } => "running",
            StepStatus::AwaitingConfirmation { .. } => "awaiting_confirmation",
            StepStatus::Complete { .. } => "complete",
            StepStatus::Failed { .. } => "failed",
            StepStatus::Skipped { .. } => "skipped",
        }
    }

    /// Steps that count as "done" for plan progress.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Complete { .. } | StepStatus::Skipped { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepStatus::Complete { .. } | StepStatus::Failed { .. } | StepStatus::Skipped { .. }
        )
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// PARSE ERRORS
// ============================================================================

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ============================================================================
// TESTS
// ============================================================================
