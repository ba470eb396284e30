use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use vigil_core::{AgentPolicy, SafetyRule, StepAction};
use vigil_engine::{check, RuleSet, SafetyGate};

fn bench_rules(count: usize) -> Vec<SafetyRule> {
    let mut rules = Vec::with_capacity(count + 2);
    for i in 0..count {
        rules.push(SafetyRule::allow(format!("read file{}", i)));
    }
    rules.push(SafetyRule::confirm("/deploy.*(prod|production)/"));
    rules.push(SafetyRule::deny("rm -rf"));
    rules
}

fn bench_safety_check(c: &mut Criterion) {
    let rules = bench_rules(50);
    let compiled = RuleSet::compile(&rules);
    let description = "Deploy the build to production after running the migration script";

    c.bench_function("safety/check_uncompiled", |b| {
        b.iter(|| {
            let result = check(black_box(description), black_box(&rules));
            black_box(result.requires_confirmation);
        });
    });

    c.bench_function("safety/check_compiled", |b| {
        b.iter(|| {
            let result = compiled.check(black_box(description));
            black_box(result.requires_confirmation);
        });
    });
}

fn bench_gate(c: &mut Criterion) {
    let policy = AgentPolicy::default()
        .with_require_approval_for_changes(true)
        .with_rule(SafetyRule::deny("drop table"))
        .with_rule(SafetyRule::confirm("/force.push/"));
    let compiled = RuleSet::compile(&policy.rules);
    let action = StepAction::new("llm", "Refactor the storage module and update its tests")
        .with_modifies_files(true)
        .with_uncertainty(0.2);

    c.bench_function("safety/gate_evaluate", |b| {
        b.iter(|| {
            let result = SafetyGate::evaluate_with(&compiled, black_box(&action), &policy);
            black_box(result.allowed);
        });
    });
}

criterion_group!(benches, bench_safety_check, bench_gate);
criterion_main!(benches);
