//! Fuzz target for the safety rule interpreter.
//!
//! Input is UTF-8: the first line is the action description, every further
//! line is a rule whose first character picks the type (`d` deny, `c`
//! confirm, anything else allow) and whose remainder is the pattern.
//! Patterns wrapped in slashes exercise the regex path, including invalid
//! expressions.
//!
//! Run with: cargo +nightly fuzz run safety_rule_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use vigil_core::SafetyRule;
use vigil_engine::{check, RuleSet};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let mut lines = input.lines();
    let description = lines.next().unwrap_or_default();
    let rules: Vec<SafetyRule> = lines
        .map(|line| {
            let mut chars = line.chars();
            match chars.next() {
                Some('d') => SafetyRule::deny(chars.as_str()),
                Some('c') => SafetyRule::confirm(chars.as_str()),
                _ => SafetyRule::allow(chars.as_str()),
            }
        })
        .collect();

    let result = check(description, &rules);

    // A blocked action never also asks for confirmation.
    assert!(result.allowed || !result.requires_confirmation);

    if let Some(index) = result.matched_rule {
        assert!(index < rules.len(), "matched rule index out of range");
    }

    // Compiling once and checking again gives the same answer.
    assert_eq!(RuleSet::compile(&rules).check(description), result);
});
