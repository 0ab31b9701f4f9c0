//! Worker pool behavior under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use foundry::core::TaskId;
use foundry::orchestration::{
    FailureKind, JobError, PoolConfig, PoolEvent, ScriptedUtilization, WorkerPool,
};
use foundry::Error;

/// Given jobs that finish in reverse order, some failing and one panicking
/// When they are collected
/// Then results come back in submission order with typed outcomes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_in_submission_order() {
    let pool = WorkerPool::new(PoolConfig::with_capacity(8));
    let mut handles = Vec::new();
    for i in 0..8u32 {
        handles.push(pool.submit(TaskId(i), async move {
            tokio::time::sleep(Duration::from_millis(u64::from(8 - i) * 10)).await;
            match i {
                3 => Err(Error::Timeout(Duration::from_secs(1))),
                5 => panic!("job {} exploded", i),
                _ => Ok(i * 10),
            }
        }));
    }

    let results = pool.collect(handles).await;
    pool.shutdown(true).await;

    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.task_id, TaskId(i as u32));
        match i {
            3 => assert!(matches!(
                result.outcome,
                Err(JobError::Failed {
                    kind: FailureKind::Timeout,
                    ..
                })
            )),
            5 => match &result.outcome {
                Err(JobError::Panicked(message)) => assert!(message.contains("exploded")),
                other => panic!("Expected panic outcome, got {:?}", other),
            },
            _ => assert_eq!(result.outcome.as_ref().ok(), Some(&(i as u32 * 10))),
        }
    }
}

/// Running jobs never exceed the admission limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bounded_by_limit() {
    let pool = WorkerPool::new(PoolConfig::with_capacity(6));
    assert_eq!(pool.set_limit(2), 2);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..10u32)
        .map(|i| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(TaskId(i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    let results = pool.collect(handles).await;
    pool.shutdown(true).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.in_flight(), 0);
}

/// Given a utilization trace that spikes and then calms down
/// When the monitor samples it
/// Then the limit shrinks to the floor, grows back, and never leaves bounds
#[tokio::test]
async fn test_monitor_follows_utilization() {
    let config = PoolConfig {
        capacity: 3,
        min_limit: 1,
        high_watermark: 80.0,
        low_watermark: 40.0,
        sample_interval_ms: 5,
    };
    let (tx, mut rx) = mpsc::channel(64);
    let pool = WorkerPool::new(config).with_events(tx);
    let samples = [95.0, 95.0, 95.0, 60.0, 10.0, 10.0, 10.0];
    pool.start_monitor(ScriptedUtilization::new(samples));

    let mut limits = Vec::new();
    while limits.len() < 4 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(PoolEvent::LimitChanged { to, .. })) => limits.push(to),
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    pool.shutdown(true).await;

    assert_eq!(limits, vec![2, 1, 2, 3]);
    assert!(limits.iter().all(|l| (1..=3).contains(l)));
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let pool = WorkerPool::new(PoolConfig::with_capacity(2));
    pool.shutdown(true).await;
    assert!(pool.is_closed());

    let result = pool.submit(TaskId(1), async { Ok(1) }).join().await;
    assert_eq!(result.outcome.unwrap_err(), JobError::PoolClosed);
}
