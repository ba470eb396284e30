//! Agent policy and safety rule types.
//!
//! The policy is configuration owned by an [`crate::Agent`]; executions read it
//! but never modify it. Rule evaluation lives in the engine's safety gate; this
//! module only describes rules and validates them.

use crate::{RejectAction, RiskLevel, RuleType, Usd, ValidationError, VigilResult};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// One entry in an agent's ordered rule list.
///
/// A pattern wrapped in slashes (`/git\s+push/`) is a case-insensitive regex.
/// Anything else is matched as case-insensitive text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SafetyRule {
    pub fn new(rule_type: RuleType, pattern: impl Into<String>) -> Self {
        Self {
            rule_type,
            pattern: pattern.into(),
            description: None,
        }
    }

    pub fn allow(pattern: impl Into<String>) -> Self {
        Self::new(RuleType::Allow, pattern)
    }

    pub fn deny(pattern: impl Into<String>) -> Self {
        Self::new(RuleType::Deny, pattern)
    }

    pub fn confirm(pattern: impl Into<String>) -> Self {
        Self::new(RuleType::Confirm, pattern)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The regex source when the pattern is written as `/.../`.
    pub fn regex_source(&self) -> Option<&str> {
        let p = self.pattern.as_str();
        if p.len() >= 2 && p.starts_with('/') && p.ends_with('/') {
            Some(&p[1..p.len() - 1])
        } else {
            None
        }
    }

    /// Human-readable label used in safety decisions.
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.pattern)
    }

    pub fn validate(&self) -> VigilResult<()> {
        if self.pattern.trim().is_empty() || self.regex_source() == Some("") {
            return Err(ValidationError::InvalidPattern {
                pattern: self.pattern.clone(),
                reason: "pattern must not be empty".to_string(),
            }
            .into());
        }
        if let Some(source) = self.regex_source() {
            RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .map_err(|e| ValidationError::InvalidPattern {
                    pattern: self.pattern.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Outcome of a safety evaluation. Pure value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub allowed: bool,
    pub requires_confirmation: bool,
    pub reason: String,
    pub risk_level: RiskLevel,
    /// Index of the rule that decided the outcome, if a rule did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<usize>,
}

impl SafetyCheckResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            requires_confirmation: false,
            reason: reason.into(),
            risk_level: RiskLevel::Low,
            matched_rule: None,
        }
    }

    pub fn deny(reason: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            allowed: false,
            requires_confirmation: false,
            reason: reason.into(),
            risk_level,
            matched_rule: None,
        }
    }

    pub fn confirm(reason: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            allowed: true,
            requires_confirmation: true,
            reason: reason.into(),
            risk_level,
            matched_rule: None,
        }
    }

    pub fn with_matched_rule(mut self, index: usize) -> Self {
        self.matched_rule = Some(index);
        self
    }

    pub fn is_blocked(&self) -> bool {
        !self.allowed
    }
}

/// Execution policy configured per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub max_steps: u32,
    /// Actions whose self-reported uncertainty exceeds this need confirmation.
    pub uncertainty_threshold: f64,
    #[serde(default)]
    pub budget_limit_usd: Option<Usd>,
    #[serde(default)]
    pub budget_limit_tokens: Option<u64>,
    #[serde(default)]
    pub require_approval_for_changes: bool,
    #[serde(default)]
    pub allow_scope_expansion: bool,
    #[serde(default = "default_true")]
    pub auto_checkpoint: bool,
    #[serde(default)]
    pub rules: Vec<SafetyRule>,
    #[serde(default)]
    pub on_reject: RejectAction,
}

fn default_true() -> bool {
    true
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            max_steps: 25,
            uncertainty_threshold: 0.7,
            budget_limit_usd: None,
            budget_limit_tokens: None,
            require_approval_for_changes: false,
            allow_scope_expansion: false,
            auto_checkpoint: true,
            rules: Vec::new(),
            on_reject: RejectAction::Halt,
        }
    }
}

impl AgentPolicy {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_budget_limit_usd(mut self, limit: Usd) -> Self {
        self.budget_limit_usd = Some(limit);
        self
    }

    pub fn with_budget_limit_tokens(mut self, limit: u64) -> Self {
        self.budget_limit_tokens = Some(limit);
        self
    }

    pub fn with_rule(mut self, rule: SafetyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    pub fn with_require_approval_for_changes(mut self, required: bool) -> Self {
        self.require_approval_for_changes = required;
        self
    }

    pub fn with_allow_scope_expansion(mut self, allowed: bool) -> Self {
        self.allow_scope_expansion = allowed;
        self
    }

    pub fn with_uncertainty_threshold(mut self, threshold: f64) -> Self {
        self.uncertainty_threshold = threshold;
        self
    }

    pub fn with_on_reject(mut self, action: RejectAction) -> Self {
        self.on_reject = action;
        self
    }

    /// Validate the policy.
    ///
    /// Validates:
    /// - max_steps > 0
    /// - uncertainty_threshold in [0.0, 1.0]
    /// - every rule pattern is non-empty and, for `/regex/` rules, compiles
    pub fn validate(&self) -> VigilResult<()> {
        if self.max_steps == 0 {
            return Err(ValidationError::InvalidValue {
                field: "max_steps".to_string(),
                reason: "max_steps must be greater than 0".to_string(),
            }
            .into());
        }

        if !(0.0..=1.0).contains(&self.uncertainty_threshold) {
            return Err(ValidationError::InvalidValue {
                field: "uncertainty_threshold".to_string(),
                reason: format!(
                    "uncertainty_threshold must be between 0.0 and 1.0, got {}",
                    self.uncertainty_threshold
                ),
            }
            .into());
        }

        for rule in &self.rules {
            rule.validate()?;
        }

        Ok(())
    }
}
