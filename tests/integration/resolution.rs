//! Model resolution against a fixed registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use foundry::core::Plan;
use foundry::models::{
    builtin_catalog, classify_plan, requirement, Classification, Complexity, ModelRegistry,
    ModelResolver, Role, WorkloadSize,
};

use crate::fixtures::{diamond_plan, registry, resolver};

fn all_classifications() -> Vec<Classification> {
    let mut out = Vec::new();
    for complexity in [Complexity::Simple, Complexity::Medium, Complexity::Heavy] {
        for size in [WorkloadSize::Small, WorkloadSize::Medium, WorkloadSize::Large] {
            out.push(Classification::new(complexity, size));
        }
    }
    out
}

#[test]
fn test_resolution_is_deterministic() {
    let first = resolver();
    let second = resolver();
    for classification in all_classifications() {
        assert_eq!(first.table(classification), second.table(classification));
        assert_eq!(
            first.required_units(classification),
            second.required_units(classification)
        );
    }
}

#[test]
fn test_medium_build_units() {
    let resolver = resolver();
    let classification = Classification::new(Complexity::Medium, WorkloadSize::Medium);
    let table = resolver.table(classification);

    assert_eq!(table.get(Role::Generator), Some("qwen2.5-coder:14b"));
    assert_eq!(table.get(Role::Reviewer), Some("qwen2.5-coder:14b"));
    assert_eq!(table.get(Role::Analyzer), Some("deepseek-r1:14b"));
    assert_eq!(table.get(Role::Summarizer), Some("mistral-nemo:12b"));

    let units: BTreeSet<String> = ["deepseek-r1:14b", "mistral-nemo:12b", "qwen2.5-coder:14b"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(resolver.required_units(classification), units);
}

#[test]
fn test_heavy_review_uses_reasoning() {
    let resolver = resolver();
    let heavy = Classification::new(Complexity::Heavy, WorkloadSize::Large);
    assert_eq!(
        resolver.resolve(Role::Reviewer, heavy).as_deref(),
        Some("deepseek-r1:32b")
    );
    assert_eq!(
        resolver.resolve(Role::Generator, heavy).as_deref(),
        Some("qwen2.5-coder:32b")
    );
}

/// Escalated models are never smaller than the role's baseline.
#[test]
fn test_escalation_not_below_baseline() {
    let registry = registry();
    let resolver = ModelResolver::new(Arc::clone(&registry), "qwen2.5-coder:7b");
    for classification in all_classifications() {
        for role in [Role::Analyzer, Role::Coder, Role::Generator] {
            let baseline = requirement(role, classification).size;
            let model = resolver
                .escalate(role, classification)
                .expect("a large model is available");
            let spec = registry.get(&model).expect("escalated model is registered");
            assert!(
                spec.size >= baseline,
                "{} for {} escalated to {} below {}",
                role,
                classification,
                model,
                baseline
            );
        }
    }
}

#[test]
fn test_nothing_available_degrades_to_default() {
    let empty = Arc::new(ModelRegistry::with_available(
        builtin_catalog(),
        Vec::<String>::new(),
    ));
    let classification = Classification::default();

    let resolver = ModelResolver::new(Arc::clone(&empty), "fallback:1b");
    assert_eq!(
        resolver.resolve(Role::Coder, classification).as_deref(),
        Some("fallback:1b")
    );
    assert_eq!(resolver.escalate(Role::Coder, classification), None);

    let no_default = ModelResolver::new(empty, "");
    assert_eq!(no_default.resolve(Role::Coder, classification), None);
    assert!(no_default.required_units(classification).is_empty());
}

#[test]
fn test_plan_classification_feeds_resolution() {
    let plan = diamond_plan();
    let classification = classify_plan(&plan, 3);
    assert_eq!(
        classification,
        Classification::new(Complexity::Medium, WorkloadSize::Medium)
    );

    let tiny = Plan::new("hello world script").with_task(1, "hello.py", "print a greeting", &[]);
    let classification = classify_plan(&tiny, 1);
    assert!(classification.is_lowest());
    assert_eq!(
        resolver().resolve(Role::Generator, classification).as_deref(),
        Some("qwen2.5-coder:7b")
    );
}
