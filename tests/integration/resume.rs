//! Interrupt and resume tests.
//!
//! A build cancelled mid-way leaves a snapshot; resuming it must end in the
//! same place as a build that was never interrupted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use foundry::core::{TaskId, TaskStatus};
use foundry::orchestration::{PipelineConfig, ProgressSnapshot};
use foundry::state::SnapshotStore;
use foundry::Error;

use crate::fixtures::{diamond_plan, Harness, PathVerifier, ScriptedGenerator, TestProject};

fn failing_c() -> PathVerifier {
    PathVerifier {
        failing: [PathBuf::from("src/c.py")].into_iter().collect(),
    }
}

fn final_statuses(progress: &ProgressSnapshot) -> BTreeMap<TaskId, TaskStatus> {
    progress.statuses.clone()
}

/// Given a build interrupted after its second round
/// When the snapshot is resumed
/// Then final statuses and round count match an uninterrupted build
#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let reference_project = TestProject::new();
    let reference = Harness::with_parts(ScriptedGenerator::default(), failing_c());
    let pipeline = reference.pipeline(&reference_project.path, PipelineConfig::default());
    let expected = pipeline.run_with_summary(diamond_plan()).await.unwrap();
    let expected_statuses = final_statuses(&pipeline.progress().await);
    pipeline.shutdown().await;

    // C is generated in round 2; the token is cancelled then
    let project = TestProject::new();
    let token = Arc::new(Mutex::new(None));
    let interrupted = Harness::with_parts(
        ScriptedGenerator {
            cancel_on: Some((PathBuf::from("src/c.py"), Arc::clone(&token))),
            ..ScriptedGenerator::default()
        },
        failing_c(),
    );
    let first = interrupted.pipeline(&project.path, PipelineConfig::default());
    *token.lock().unwrap() = Some(first.cancel_token());

    let partial = first.run_with_summary(diamond_plan()).await.unwrap();
    first.shutdown().await;
    assert!(partial.interrupted);
    assert!(!partial.success());
    assert_eq!(partial.rounds, 2);

    let snapshot = SnapshotStore::new(&project.path).load().await.unwrap();
    assert!(!snapshot.is_finished());
    assert_eq!(snapshot.round, 2);
    assert_eq!(snapshot.build_id, partial.build_id);

    let resumed_harness = Harness::with_parts(ScriptedGenerator::default(), failing_c());
    let second = resumed_harness.pipeline(&project.path, PipelineConfig::default());
    let resumed = second.resume_with_summary().await.unwrap();
    let resumed_statuses = final_statuses(&second.progress().await);
    second.shutdown().await;

    assert_eq!(resumed.build_id, partial.build_id);
    assert!(!resumed.interrupted);
    assert_eq!(resumed.rounds, expected.rounds);
    assert_eq!(resumed_statuses, expected_statuses);
    assert_eq!(
        (resumed.verified, resumed.failed, resumed.skipped),
        (expected.verified, expected.failed, expected.skipped)
    );
    // A and B were not regenerated after the restart
    assert_eq!(
        resumed_harness
            .generator
            .calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_resume_without_snapshot() {
    let project = TestProject::new();
    let harness = Harness::failing_verification(&[]);
    let pipeline = harness.pipeline(&project.path, PipelineConfig::default());

    let err = pipeline.resume().await.unwrap_err();
    pipeline.shutdown().await;
    assert!(matches!(err, Error::SnapshotNotFound(_)));
}

/// Resuming a finished build changes nothing.
#[tokio::test]
async fn test_resume_finished_build_is_noop() {
    let project = TestProject::new();
    let harness = Harness::failing_verification(&[]);
    let pipeline = harness.pipeline(&project.path, PipelineConfig::default());
    let first = pipeline.run_with_summary(diamond_plan()).await.unwrap();

    let again = pipeline.resume_with_summary().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(again.rounds, first.rounds);
    assert_eq!(again.verified, 4);
    assert_eq!(harness.generator.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
}
