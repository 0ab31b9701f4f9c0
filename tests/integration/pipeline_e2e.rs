//! End-to-end pipeline runs against scripted collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use foundry::core::{Plan, TaskGraph, TaskId, TaskStatus};
use foundry::orchestration::{Phase, PipelineConfig, PipelineEvent};
use foundry::Error;

use crate::fixtures::{diamond_plan, Harness, PathVerifier, ScriptedGenerator, TestProject};

fn statuses(snapshot: &foundry::state::BuildSnapshot) -> BTreeMap<TaskId, TaskStatus> {
    snapshot.tasks.iter().map(|t| (t.id, t.status)).collect()
}

#[test]
fn test_diamond_waves() {
    let graph = TaskGraph::new(diamond_plan().into_tasks()).unwrap();
    assert_eq!(
        graph.waves().unwrap(),
        vec![
            vec![TaskId(1), TaskId(2)],
            vec![TaskId(3)],
            vec![TaskId(4)]
        ]
    );
}

/// Given every collaborator succeeds
/// When the diamond plan runs
/// Then all four tasks are verified and written to disk
#[tokio::test]
async fn test_all_tasks_verified() {
    let project = TestProject::new();
    let harness = Harness::failing_verification(&[]);
    let pipeline = harness.pipeline(&project.path, PipelineConfig::default());

    let summary = pipeline.run_with_summary(diamond_plan()).await.unwrap();
    pipeline.shutdown().await;

    assert!(summary.success());
    assert_eq!(summary.verified, 4);
    assert_eq!(summary.rounds, 3, "one round per wave");
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 4);
    assert_eq!(harness.coder.calls.load(Ordering::SeqCst), 0);

    let d = project.read("src/d.py").expect("artifact written");
    assert!(d.starts_with("# src/d.py\n# deps: 2\n"));

    let snapshot = pipeline.store().load().await.unwrap();
    assert!(snapshot.is_finished());
    assert_eq!(snapshot.artifacts.len(), 4);
}

/// Given task C always fails verification
/// When the diamond plan runs
/// Then A and B are verified, C fails, and D is skipped
#[tokio::test]
async fn test_failing_dependency_skips_dependent() {
    let project = TestProject::new();
    let harness = Harness::failing_verification(&["src/c.py"]);
    let (tx, mut rx) = mpsc::channel(1024);
    let pipeline = harness
        .pipeline(&project.path, PipelineConfig::default())
        .with_events(tx);

    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let ok = pipeline.run(diamond_plan()).await.unwrap();
    assert!(!ok);
    let progress = pipeline.progress().await;
    pipeline.shutdown().await;
    drop(pipeline);
    let events = collector.await.unwrap();

    assert_eq!(progress.statuses[&TaskId(1)], TaskStatus::Verified);
    assert_eq!(progress.statuses[&TaskId(2)], TaskStatus::Verified);
    assert_eq!(progress.statuses[&TaskId(3)], TaskStatus::Failed);
    assert_eq!(progress.statuses[&TaskId(4)], TaskStatus::Skipped);
    assert_eq!(progress.wave, None);

    // D never reaches the generator
    assert!(!events.iter().any(|e| matches!(
        e,
        PipelineEvent::PhaseStarted { phase: Phase::Generate, tasks, .. } if tasks.contains(&TaskId(4))
    )));
    // D only changes status once, when it is skipped
    let d_changes: Vec<TaskStatus> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TaskStatusChanged { task_id, status } if *task_id == TaskId(4) => {
                Some(*status)
            }
            _ => None,
        })
        .collect();
    assert_eq!(d_changes, vec![TaskStatus::Skipped]);

    // three fix attempts before C gives up, the later ones escalated
    assert_eq!(harness.coder.calls.load(Ordering::SeqCst), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::TaskEscalated { task_id, .. } if *task_id == TaskId(3))));

    match events.last() {
        Some(PipelineEvent::BuildFinished { summary }) => {
            assert_eq!(summary.verified, 2);
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.skipped, 1);
            assert!(!summary.interrupted);
        }
        other => panic!("Expected BuildFinished last, got {:?}", other),
    }
}

/// Given generation keeps failing and the patch step is broken
/// When the iteration cap is reached
/// Then the stuck task is failed and its dependents are skipped
#[tokio::test]
async fn test_iteration_cap_settles_everything() {
    let project = TestProject::new();
    let mut harness = Harness::with_parts(
        ScriptedGenerator {
            failing: ["src/a.py".into()].into_iter().collect(),
            ..ScriptedGenerator::default()
        },
        PathVerifier::default(),
    );
    harness.coder = std::sync::Arc::new(crate::fixtures::ScriptedCoder {
        fail: true,
        ..Default::default()
    });
    let config = PipelineConfig {
        max_iterations: 2,
        max_task_failures: 10,
        escalate_after: 5,
    };
    let pipeline = harness.pipeline(&project.path, config);

    let summary = pipeline.run_with_summary(diamond_plan()).await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(summary.rounds, 2);
    let snapshot = pipeline.store().load().await.unwrap();
    let statuses = statuses(&snapshot);
    assert_eq!(statuses[&TaskId(1)], TaskStatus::Failed);
    assert_eq!(statuses[&TaskId(2)], TaskStatus::Verified);
    assert_eq!(statuses[&TaskId(3)], TaskStatus::Skipped);
    assert_eq!(statuses[&TaskId(4)], TaskStatus::Skipped);
    let a = snapshot.tasks.iter().find(|t| t.id == TaskId(1)).unwrap();
    assert_eq!(a.last_error.as_deref(), Some("iteration budget exhausted"));
}

/// A failed diagnosis still lets the patch step run.
#[tokio::test]
async fn test_failed_analysis_falls_back() {
    let project = TestProject::new();
    let mut harness = Harness::failing_verification(&[]);
    harness.generator = std::sync::Arc::new(ScriptedGenerator {
        failing: ["src/b.py".into()].into_iter().collect(),
        ..ScriptedGenerator::default()
    });
    harness.analyzer = std::sync::Arc::new(crate::fixtures::ScriptedAnalyzer {
        fail: true,
        ..Default::default()
    });
    let pipeline = harness.pipeline(&project.path, PipelineConfig::default());

    let summary = pipeline.run_with_summary(diamond_plan()).await.unwrap();
    pipeline.shutdown().await;

    assert!(summary.success());
    assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.coder.calls.load(Ordering::SeqCst), 1);
    assert!(project.read("src/b.py").unwrap().ends_with("# patched\n"));
}

#[tokio::test]
async fn test_cycle_aborts_before_any_work() {
    let project = TestProject::new();
    let harness = Harness::failing_verification(&[]);
    let pipeline = harness.pipeline(&project.path, PipelineConfig::default());

    let plan = Plan::new("cyclic")
        .with_task(1, "a.py", "a", &[2])
        .with_task(2, "b.py", "b", &[1])
        .with_task(3, "c.py", "c", &[]);
    let err = pipeline.run(plan).await.unwrap_err();
    pipeline.shutdown().await;

    match err {
        Error::Cycle { unreached } => assert_eq!(unreached, vec![TaskId(1), TaskId(2)]),
        other => panic!("Expected Cycle, got {:?}", other),
    }
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);
    assert!(!pipeline.store().exists());
}

#[tokio::test]
async fn test_unknown_dependency_strict_and_lenient() {
    let plan = Plan::new("dangling")
        .with_task(1, "a.py", "a", &[])
        .with_task(2, "b.py", "b", &[1, 9]);

    let project = TestProject::new();
    let harness = Harness::failing_verification(&[]);
    let strict = harness.pipeline(&project.path, PipelineConfig::default());
    let err = strict.run(plan.clone()).await.unwrap_err();
    strict.shutdown().await;
    assert!(err.is_structural());

    let lenient = harness
        .pipeline(&project.path, PipelineConfig::default())
        .strict_dependencies(false);
    assert!(lenient.run(plan).await.unwrap());
    lenient.shutdown().await;
}

/// Given C can be neither generated nor patched
/// When its failure budget runs out well before the iteration cap
/// Then C fails with the give-up reason and only D is skipped
#[tokio::test]
async fn test_failure_budget_gives_up_before_iteration_cap() {
    let project = TestProject::new();
    let mut harness = Harness::with_parts(
        ScriptedGenerator {
            failing: ["src/c.py".into()].into_iter().collect(),
            ..ScriptedGenerator::default()
        },
        PathVerifier::default(),
    );
    harness.coder = std::sync::Arc::new(crate::fixtures::ScriptedCoder {
        fail: true,
        ..Default::default()
    });
    let config = PipelineConfig {
        max_iterations: 20,
        max_task_failures: 2,
        escalate_after: 1,
    };
    let pipeline = harness.pipeline(&project.path, config);

    let summary = pipeline.run_with_summary(diamond_plan()).await.unwrap();
    pipeline.shutdown().await;

    assert!(summary.rounds <= 5, "took {} rounds", summary.rounds);
    assert_eq!(harness.coder.calls.load(Ordering::SeqCst), 2);

    let snapshot = pipeline.store().load().await.unwrap();
    let statuses = statuses(&snapshot);
    assert_eq!(statuses[&TaskId(1)], TaskStatus::Verified);
    assert_eq!(statuses[&TaskId(2)], TaskStatus::Verified);
    assert_eq!(statuses[&TaskId(3)], TaskStatus::Failed);
    assert_eq!(statuses[&TaskId(4)], TaskStatus::Skipped);

    let c = snapshot.tasks.iter().find(|t| t.id == TaskId(3)).unwrap();
    let reason = c.last_error.as_deref().unwrap_or_default();
    assert!(reason.starts_with("gave up after 2 fix attempts"), "{}", reason);
    assert!(project.read("src/d.py").is_none());
}

/// Plans built in code skip `Plan::load`; escaping paths are still refused
/// before anything is generated or written.
#[tokio::test]
async fn test_escaping_paths_rejected_at_run() {
    let project = TestProject::new();
    let root = project.path.join("root");
    std::fs::create_dir_all(&root).unwrap();
    let absolute = project.path.join("absolute.py");
    let plans = [
        Plan::new("absolute").with_task(1, &absolute.display().to_string(), "a", &[]),
        Plan::new("parent")
            .with_task(1, "src/ok.py", "fine", &[])
            .with_task(2, "../parent.py", "escapes", &[1]),
    ];

    for plan in plans {
        let harness = Harness::failing_verification(&[]);
        let pipeline = harness.pipeline(&root, PipelineConfig::default());
        let err = pipeline.run(plan).await.unwrap_err();
        pipeline.shutdown().await;

        assert!(matches!(err, Error::Validation(_)), "got {:?}", err);
        assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.store().exists());
    }
    assert!(!absolute.exists());
    assert!(!project.path.join("parent.py").exists());
    assert!(!root.join("src/ok.py").exists());
}

/// A snapshot edited to point outside the root is refused on resume.
#[tokio::test]
async fn test_escaping_paths_rejected_at_resume() {
    let project = TestProject::new();
    let root = project.path.join("root");
    std::fs::create_dir_all(&root).unwrap();
    let harness = Harness::failing_verification(&[]);
    let pipeline = harness.pipeline(&root, PipelineConfig::default());
    pipeline.run(diamond_plan()).await.unwrap();

    let mut snapshot = pipeline.store().load().await.unwrap();
    let d = snapshot
        .tasks
        .iter_mut()
        .find(|t| t.id == TaskId(4))
        .unwrap();
    d.path = "../escaped.py".into();
    d.status = TaskStatus::Pending;
    pipeline.store().save(&snapshot).await.unwrap();

    let err = pipeline.resume().await.unwrap_err();
    pipeline.shutdown().await;
    assert!(matches!(err, Error::Validation(_)), "got {:?}", err);
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 4);
    assert!(!project.path.join("escaped.py").exists());
}
