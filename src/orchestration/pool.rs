//! Worker pool with an adaptive admission limit.
//!
//! The `WorkerPool` runs jobs as tokio tasks. A job waits on an admission
//! semaphore before it starts; the number of permits tracks a live limit
//! that a background monitor moves between `min_limit` and `capacity`
//! based on host utilization. Job failures and panics come back as typed
//! `JobError`s inside each `WorkerResult`, in submission order.

use crate::core::task::TaskId;
use crate::error::Error;
use crate::orchestration::utilization::UtilizationSource;
use crate::{flog, flog_debug, flog_trace, flog_warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on concurrently running jobs.
    pub capacity: usize,
    /// Floor for the admission limit.
    pub min_limit: usize,
    /// Shrink the limit when utilization is above this percentage.
    pub high_watermark: f32,
    /// Grow the limit when utilization is below this percentage.
    pub low_watermark: f32,
    pub sample_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            capacity: cores.max(1),
            min_limit: 1,
            high_watermark: 85.0,
            low_watermark: 50.0,
            sample_interval_ms: 2000,
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

/// Next admission limit for one utilization sample. Moves at most one step
/// and never leaves `[min_limit, capacity]`.
pub fn adjust(limit: usize, utilization: f32, config: &PoolConfig) -> usize {
    let next = if utilization > config.high_watermark && limit > config.min_limit {
        limit - 1
    } else if utilization < config.low_watermark && limit < config.capacity {
        limit + 1
    } else {
        limit
    };
    next.clamp(config.min_limit.max(1), config.capacity.max(1))
}

/// What kind of error a failed job hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Invocation,
    Timeout,
    Io,
    Parse,
    Other,
}

impl FailureKind {
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Invocation { .. } => FailureKind::Invocation,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Io(_) => FailureKind::Io,
            Error::Parse(_) | Error::Json(_) => FailureKind::Parse,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{kind:?} failure: {message}")]
    Failed { kind: FailureKind, message: String },

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("worker pool is closed")]
    PoolClosed,
}

impl From<Error> for JobError {
    fn from(error: Error) -> Self {
        JobError::Failed {
            kind: FailureKind::of(&error),
            message: error.to_string(),
        }
    }
}

/// Outcome of one job.
#[derive(Debug)]
pub struct WorkerResult<T> {
    pub task_id: TaskId,
    pub outcome: std::result::Result<T, JobError>,
    /// Run time once admitted, or time since submission for panics.
    pub duration: Duration,
}

impl<T> WorkerResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Events emitted by the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    JobStarted {
        task_id: TaskId,
    },
    JobFinished {
        task_id: TaskId,
        ok: bool,
    },
    LimitChanged {
        from: usize,
        to: usize,
        utilization: f32,
    },
}

type JobOutput<T> = (std::result::Result<T, JobError>, Duration);

/// A submitted job. Consumed by `join` or `WorkerPool::collect`.
pub struct JobHandle<T> {
    task_id: TaskId,
    submitted: Instant,
    inner: Option<JoinHandle<JobOutput<T>>>,
}

impl<T> JobHandle<T> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn join(self) -> WorkerResult<T> {
        let Some(handle) = self.inner else {
            return WorkerResult {
                task_id: self.task_id,
                outcome: Err(JobError::PoolClosed),
                duration: Duration::ZERO,
            };
        };
        let (outcome, duration) = match handle.await {
            Ok(output) => output,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                (Err(JobError::Panicked(message)), self.submitted.elapsed())
            }
            Err(e) => (
                Err(JobError::Failed {
                    kind: FailureKind::Other,
                    message: e.to_string(),
                }),
                self.submitted.elapsed(),
            ),
        };
        WorkerResult {
            task_id: self.task_id,
            outcome,
            duration,
        }
    }
}

#[derive(Debug)]
struct LimitState {
    limit: usize,
    /// Permits to retire as running jobs release them.
    debt: usize,
}

/// Shared admission state.
struct Admission {
    semaphore: Arc<Semaphore>,
    state: Mutex<LimitState>,
    capacity: usize,
    min_limit: usize,
    /// Jobs holding a permit.
    running: AtomicUsize,
    /// Jobs submitted and not yet finished.
    active: AtomicUsize,
    idle: Notify,
}

impl Admission {
    fn lock(&self) -> std::sync::MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Move the limit one permit at a time. Shrinking takes a free permit
    /// out of circulation, or records debt when every permit is in use.
    fn set_limit(&self, wanted: usize) -> usize {
        let wanted = wanted.clamp(self.min_limit, self.capacity);
        let mut state = self.lock();
        while state.limit > wanted {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit.forget(),
                Err(_) => state.debt += 1,
            }
            state.limit -= 1;
        }
        while state.limit < wanted {
            if state.debt > 0 {
                state.debt -= 1;
            } else {
                self.semaphore.add_permits(1);
            }
            state.limit += 1;
        }
        state.limit
    }

    async fn admit(self: &Arc<Self>) -> Option<Slot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(Slot {
            permit: Some(permit),
            admission: Arc::clone(self),
        })
    }
}

/// A held admission permit. Dropping it pays off limit debt first.
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    admission: Arc<Admission>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.admission.running.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.admission.lock();
        if let Some(permit) = self.permit.take() {
            if state.debt > 0 {
                state.debt -= 1;
                permit.forget();
            }
        }
    }
}

/// Counts a submitted job until its tokio task ends, panics included.
struct ActiveGuard(Arc<Admission>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs jobs under an adaptive admission limit.
///
/// # Example
///
/// ```ignore
/// use foundry::orchestration::{PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::with_capacity(4));
/// let handles = vec![pool.submit(TaskId(1), async { Ok(1) })];
/// let results = pool.collect(handles).await;
/// pool.shutdown(true).await;
/// ```
pub struct WorkerPool {
    config: PoolConfig,
    admission: Arc<Admission>,
    closed: AtomicBool,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: Option<mpsc::Sender<PoolEvent>>,
}

fn emit(events: &Option<mpsc::Sender<PoolEvent>>, event: PoolEvent) {
    if let Some(tx) = events {
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            flog_trace!("Pool event dropped, receiver is behind: {:?}", event);
        }
    }
}

impl WorkerPool {
    /// Create a pool admitting `capacity` jobs until a monitor says otherwise.
    pub fn new(config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let min_limit = config.min_limit.clamp(1, capacity);
        let admission = Arc::new(Admission {
            semaphore: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(LimitState {
                limit: capacity,
                debt: 0,
            }),
            capacity,
            min_limit,
            running: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        flog_debug!("WorkerPool::new capacity={} min_limit={}", capacity, min_limit);
        Self {
            config,
            admission,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
            events: None,
        }
    }

    /// Report job and limit changes on `events`. Sends never wait: when the
    /// channel is full the event is dropped, so a slow receiver cannot stall
    /// jobs or the monitor.
    pub fn with_events(mut self, events: mpsc::Sender<PoolEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Start sampling `source` every `sample_interval`, adjusting the
    /// admission limit. Replaces any running monitor.
    pub fn start_monitor<S>(&self, mut source: S)
    where
        S: UtilizationSource + 'static,
    {
        let admission = Arc::clone(&self.admission);
        let cancel = self.cancel.child_token();
        let config = self.config.clone();
        let events = self.events.clone();
        let interval = config.sample_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let utilization = source.sample();
                        let from = admission.limit();
                        let wanted = adjust(from, utilization, &config);
                        if wanted != from {
                            let to = admission.set_limit(wanted);
                            flog_debug!(
                                "Admission limit {} -> {} (utilization {:.1}%)",
                                from,
                                to,
                                utilization
                            );
                            emit(&events, PoolEvent::LimitChanged { from, to, utilization });
                        }
                    }
                }
            }
            flog_debug!("Pool monitor stopped");
        });

        let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Submit a job for `task_id`.
    ///
    /// The job starts once admitted. Its error is converted to a
    /// `JobError`; after `shutdown` the handle resolves to `PoolClosed`.
    pub fn submit<T, F>(&self, task_id: TaskId, job: F) -> JobHandle<T>
    where
        F: Future<Output = crate::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let submitted = Instant::now();
        if self.closed.load(Ordering::SeqCst) {
            flog_warn!("Job for task {} submitted after shutdown", task_id);
            return JobHandle {
                task_id,
                submitted,
                inner: None,
            };
        }

        self.admission.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.admission));
        let admission = Arc::clone(&self.admission);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Some(slot) = admission.admit().await else {
                return (Err(JobError::PoolClosed), Duration::ZERO);
            };
            emit(&events, PoolEvent::JobStarted { task_id });

            let started = Instant::now();
            let outcome = job.await.map_err(JobError::from);
            let duration = started.elapsed();
            drop(slot);

            emit(
                &events,
                PoolEvent::JobFinished {
                    task_id,
                    ok: outcome.is_ok(),
                },
            );
            (outcome, duration)
        });

        JobHandle {
            task_id,
            submitted,
            inner: Some(handle),
        }
    }

    /// Wait for every handle; results keep submission order.
    pub async fn collect<T>(&self, handles: Vec<JobHandle<T>>) -> Vec<WorkerResult<T>> {
        futures::future::join_all(handles.into_iter().map(JobHandle::join)).await
    }

    /// Set the admission limit, clamped to `[min_limit, capacity]`.
    /// Returns the limit actually applied.
    pub fn set_limit(&self, limit: usize) -> usize {
        self.admission.set_limit(limit)
    }

    pub fn admission_limit(&self) -> usize {
        self.admission.limit()
    }

    pub fn capacity(&self) -> usize {
        self.admission.capacity
    }

    pub fn min_limit(&self) -> usize {
        self.admission.min_limit
    }

    /// Jobs currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.admission.running.load(Ordering::SeqCst)
    }

    /// Jobs submitted and not yet finished, admitted or not.
    pub fn pending(&self) -> usize {
        self.admission.active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the monitor and refuse new jobs. With `wait`, returns once
    /// every submitted job has finished; running jobs are never cancelled.
    pub async fn shutdown(&self, wait: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        if wait {
            loop {
                let idle = self.admission.idle.notified();
                if self.admission.active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                idle.await;
            }
        }
        flog!("Worker pool shut down (wait={})", wait);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.admission.capacity)
            .field("limit", &self.admission_limit())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}
