//! Safety Gate
//!
//! Pure policy evaluation: nothing in this module performs I/O or keeps
//! state between calls, so identical inputs always produce identical results.
//!
//! # Rule interpretation
//!
//! Rules are tried in declared order. The first matching `deny` rule blocks
//! the action outright; failing that, the first matching `confirm` rule asks
//! for confirmation; otherwise the action is allowed at low risk. A matching
//! `allow` rule never overrides a `deny` or `confirm`, wherever it appears.
//!
//! A pattern wrapped in slashes (`/deploy.*prod/`) is a case-insensitive
//! regular expression. Any other pattern matches when it occurs in the
//! description as a case-insensitive substring, or when every one of its
//! words occurs among the description's words. Words are runs of
//! alphanumeric characters, so `force push` matches `git push --force`.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use vigil_core::{AgentPolicy, RiskLevel, RuleType, SafetyCheckResult, SafetyRule, StepAction};

// ============================================================================
// MATCHERS
// ============================================================================

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Text { needle: String, words: Vec<String> },
    /// Blank pattern: matches nothing.
    Never,
}

impl Matcher {
    fn compile(rule: &SafetyRule) -> Self {
        if let Some(source) = rule.regex_source() {
            match RegexBuilder::new(source).case_insensitive(true).build() {
                Ok(regex) => return Matcher::Regex(regex),
                Err(err) => {
                    tracing::debug!(pattern = %rule.pattern, error = %err, "invalid rule regex, matching literally");
                    return Matcher::text(source);
                }
            }
        }
        Matcher::text(&rule.pattern)
    }

    fn text(pattern: &str) -> Self {
        let needle = pattern.trim().to_lowercase();
        if needle.is_empty() {
            return Matcher::Never;
        }
        Matcher::Text {
            words: tokenize(&needle).collect(),
            needle,
        }
    }

    fn matches(&self, subject: &Subject<'_>) -> bool {
        match self {
            Matcher::Regex(regex) => regex.is_match(subject.raw),
            Matcher::Text { needle, words } => {
                subject.lowered.contains(needle.as_str())
                    || (!words.is_empty() && words.iter().all(|w| subject.words.contains(w.as_str())))
            }
            Matcher::Never => false,
        }
    }
}

/// Description prepared once per evaluation.
struct Subject<'a> {
    raw: &'a str,
    lowered: String,
    words: HashSet<String>,
}

impl<'a> Subject<'a> {
    fn new(raw: &'a str) -> Self {
        let lowered = raw.to_lowercase();
        let words = tokenize(&lowered).collect();
        Self {
            raw,
            lowered,
            words,
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
struct CompiledRule {
    rule_type: RuleType,
    label: String,
    matcher: Matcher,
}

/// Rules compiled once for repeated evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[SafetyRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|rule| CompiledRule {
                    rule_type: rule.rule_type,
                    label: rule.label().to_string(),
                    matcher: Matcher::compile(rule),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a description against the rules.
    pub fn check(&self, description: &str) -> SafetyCheckResult {
        let subject = Subject::new(description);
        if let Some(result) = self.first_of(RuleType::Deny, &subject) {
            return result;
        }
        if let Some(result) = self.first_of(RuleType::Confirm, &subject) {
            return result;
        }
        match self.first_index(RuleType::Allow, &subject) {
            Some(index) => SafetyCheckResult::allow(format!(
                "Allowed by rule {}: {}",
                index, self.rules[index].label
            ))
            .with_matched_rule(index),
            None => SafetyCheckResult::allow("No rule matched"),
        }
    }

    fn first_index(&self, rule_type: RuleType, subject: &Subject<'_>) -> Option<usize> {
        self.rules
            .iter()
            .position(|rule| rule.rule_type == rule_type && rule.matcher.matches(subject))
    }

    fn first_of(&self, rule_type: RuleType, subject: &Subject<'_>) -> Option<SafetyCheckResult> {
        let index = self.first_index(rule_type, subject)?;
        let label = &self.rules[index].label;
        let result = match rule_type {
            RuleType::Deny => SafetyCheckResult::deny(
                format!("Blocked by rule {}: {}", index, label),
                RiskLevel::High,
            ),
            RuleType::Confirm => SafetyCheckResult::confirm(
                format!("Confirmation required by rule {}: {}", index, label),
                RiskLevel::Medium,
            ),
            RuleType::Allow => SafetyCheckResult::allow(format!("Allowed by rule {}: {}", index, label)),
        };
        Some(result.with_matched_rule(index))
    }

    fn denies(&self, subject: &Subject<'_>) -> Option<SafetyCheckResult> {
        self.first_of(RuleType::Deny, subject)
    }

    fn confirms(&self, subject: &Subject<'_>) -> Option<SafetyCheckResult> {
        self.first_of(RuleType::Confirm, subject)
    }
}

/// Check an action description against rules in priority order.
pub fn check(description: &str, rules: &[SafetyRule]) -> SafetyCheckResult {
    RuleSet::compile(rules).check(description)
}

// ============================================================================
// SAFETY GATE
// ============================================================================

/// Evaluates a proposed action against an agent's whole policy.
///
/// Order: rule deny, unapproved scope expansion (deny), rule confirm, file
/// changes under `require_approval_for_changes` (confirm), uncertainty above
/// the policy threshold (confirm), then allow.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGate;

impl SafetyGate {
    pub fn evaluate(action: &StepAction, policy: &AgentPolicy) -> SafetyCheckResult {
        Self::evaluate_with(&RuleSet::compile(&policy.rules), action, policy)
    }

    pub fn evaluate_with(
        rules: &RuleSet,
        action: &StepAction,
        policy: &AgentPolicy,
    ) -> SafetyCheckResult {
        let subject = Subject::new(&action.description);

        if let Some(denied) = rules.denies(&subject) {
            return denied;
        }
        if action.expands_scope && !policy.allow_scope_expansion {
            return SafetyCheckResult::deny(
                "Action expands scope and the policy does not allow scope expansion",
                RiskLevel::High,
            );
        }
        if let Some(confirm) = rules.confirms(&subject) {
            return confirm;
        }
        if action.modifies_files && policy.require_approval_for_changes {
            return SafetyCheckResult::confirm(
                "Policy requires approval for file changes",
                RiskLevel::Medium,
            );
        }
        if let Some(uncertainty) = action.uncertainty {
            if uncertainty > policy.uncertainty_threshold {
                return SafetyCheckResult::confirm(
                    format!(
                        "Uncertainty {:.2} exceeds threshold {:.2}",
                        uncertainty, policy.uncertainty_threshold
                    ),
                    RiskLevel::Medium,
                );
            }
        }
        rules.check(&action.description)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_test_utils::{assert_blocked, assert_needs_confirmation};

    #[test]
    fn test_no_rules_allows_at_low_risk() {
        let result = check("anything at all", &[]);
        assert!(result.allowed);
        assert!(!result.requires_confirmation);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.matched_rule, None);
    }

    #[test]
    fn test_deny_wins_over_later_allow() {
        let rules = vec![SafetyRule::deny("force push"), SafetyRule::allow("git push")];
        let result = check("git push --force origin main", &rules);
        assert_blocked(&result, RiskLevel::High);
        assert_eq!(result.matched_rule, Some(0));
    }

    #[test]
    fn test_deny_wins_over_earlier_allow_and_confirm() {
        let rules = vec![
            SafetyRule::allow("push"),
            SafetyRule::confirm("push"),
            SafetyRule::deny("/push\\s+--force/"),
        ];
        let result = check("git push --force", &rules);
        assert_blocked(&result, RiskLevel::High);
        assert_eq!(result.matched_rule, Some(2));
    }

    #[test]
    fn test_first_confirm_wins() {
        let rules = vec![
            SafetyRule::confirm("deploy").with_description("any deploy"),
            SafetyRule::confirm("prod").with_description("production"),
        ];
        let result = check("deploy to prod", &rules);
        assert_needs_confirmation(&result);
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.matched_rule, Some(0));
        assert!(result.reason.contains("any deploy"));
    }

    #[test]
    fn test_substring_is_case_insensitive() {
        let rules = vec![SafetyRule::deny("RM -RF")];
        assert!(!check("please rm -rf /tmp/build", &rules).allowed);
    }

    #[test]
    fn test_regex_pattern() {
        let rules = vec![SafetyRule::confirm("/deploy.*prod(uction)?/")];
        assert!(check("Deploy service to PRODUCTION", &rules).requires_confirmation);
        assert!(!check("deploy to staging", &rules).requires_confirmation);
    }

    #[test]
    fn test_invalid_regex_degrades_to_literal() {
        let rules = vec![SafetyRule::deny("/drop (table/")];
        assert!(!check("DROP (TABLE users", &rules).allowed);
        assert!(check("drop table users", &rules).allowed);
    }

    #[test]
    fn test_word_match_requires_every_word() {
        let rules = vec![SafetyRule::deny("delete production database")];
        assert!(!check("database: delete rows in production", &rules).allowed);
        assert!(check("delete rows in staging database", &rules).allowed);
    }

    #[test]
    fn test_blank_pattern_never_matches() {
        let rules = vec![SafetyRule::deny("   ")];
        assert!(check("anything here", &rules).allowed);
    }

    #[test]
    fn test_punctuation_pattern_matches_as_substring_only() {
        let rules = vec![SafetyRule::deny("--")];
        assert!(!check("git push -- force", &rules).allowed);
        assert!(check("git push force", &rules).allowed);
    }

    #[test]
    fn test_allow_rule_is_reported() {
        let rules = vec![SafetyRule::allow("read")];
        let result = check("read config", &rules);
        assert!(result.allowed);
        assert_eq!(result.matched_rule, Some(0));
    }

    #[test]
    fn test_gate_scope_expansion_denied() {
        let policy = AgentPolicy::default();
        let action = StepAction::new("llm", "add a new service").with_expands_scope(true);
        assert_blocked(&SafetyGate::evaluate(&action, &policy), RiskLevel::High);

        let permissive = AgentPolicy::default().with_allow_scope_expansion(true);
        assert!(SafetyGate::evaluate(&action, &permissive).allowed);
    }

    #[test]
    fn test_gate_rule_deny_before_scope_and_confirm() {
        let policy = AgentPolicy::default()
            .with_rule(SafetyRule::confirm("refactor"))
            .with_rule(SafetyRule::deny("secret"));
        let action = StepAction::new("llm", "refactor secret handling");
        let result = SafetyGate::evaluate(&action, &policy);
        assert_blocked(&result, RiskLevel::High);
        assert_eq!(result.matched_rule, Some(1));
    }

    #[test]
    fn test_gate_file_changes_need_approval() {
        let policy = AgentPolicy::default().with_require_approval_for_changes(true);
        let action = StepAction::new("edit", "rename module").with_modifies_files(true);
        assert_needs_confirmation(&SafetyGate::evaluate(&action, &policy));

        let read_only = StepAction::new("read", "list modules");
        assert!(!SafetyGate::evaluate(&read_only, &policy).requires_confirmation);
    }

    #[test]
    fn test_gate_uncertainty_threshold() {
        let policy = AgentPolicy::default().with_uncertainty_threshold(0.5);
        let unsure = StepAction::new("llm", "guess config").with_uncertainty(0.8);
        let sure = StepAction::new("llm", "guess config").with_uncertainty(0.5);
        assert_needs_confirmation(&SafetyGate::evaluate(&unsure, &policy));
        assert!(!SafetyGate::evaluate(&sure, &policy).requires_confirmation);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use vigil_test_utils::generators::{arb_action, arb_description, arb_policy, arb_rules};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: check is idempotent for identical inputs
        #[test]
        fn prop_check_idempotent(description in arb_description(), rules in arb_rules()) {
            prop_assert_eq!(check(&description, &rules), check(&description, &rules));
        }

        /// Property: a compiled rule set agrees with one-shot checking
        #[test]
        fn prop_rule_set_matches_check(description in arb_description(), rules in arb_rules()) {
            let compiled = RuleSet::compile(&rules);
            prop_assert_eq!(compiled.check(&description), check(&description, &rules));
        }

        /// Property: a matching deny at the front blocks regardless of what follows
        #[test]
        fn prop_leading_deny_always_blocks(description in arb_description(), rest in arb_rules()) {
            let word = description.split(' ').next().unwrap_or_default().to_string();
            let mut rules = vec![SafetyRule::deny(word)];
            rules.extend(rest);
            let result = check(&description, &rules);
            prop_assert!(!result.allowed);
            prop_assert_eq!(result.risk_level, RiskLevel::High);
            prop_assert_eq!(result.matched_rule, Some(0));
        }

        /// Property: blocked results never also ask for confirmation, and
        /// confirmations are always allowed
        #[test]
        fn prop_result_shape(action in arb_action(), policy in arb_policy()) {
            let result = SafetyGate::evaluate(&action, &policy);
            if !result.allowed {
                prop_assert!(!result.requires_confirmation);
                prop_assert_eq!(result.risk_level, RiskLevel::High);
            }
            if result.requires_confirmation {
                prop_assert!(result.allowed);
                prop_assert_eq!(result.risk_level, RiskLevel::Medium);
            }
        }

        /// Property: the gate never allows what the plain rules deny
        #[test]
        fn prop_gate_respects_rule_denies(action in arb_action(), policy in arb_policy()) {
            if !check(&action.description, &policy.rules).allowed {
                prop_assert!(!SafetyGate::evaluate(&action, &policy).allowed);
            }
        }
    }
}
