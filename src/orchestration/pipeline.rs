//! Round-based build pipeline.
//!
//! Each round takes the ready set from the task graph and runs four phases
//! over it: generate and review through the worker pool, verify on the
//! orchestrating task, then fix failing tasks one at a time with diagnosis
//! and patch jobs. A snapshot is saved after every round. The loop ends when
//! every task is terminal or the iteration budget is spent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{Plan, Task, TaskGraph, TaskId, TaskStatus};
use crate::error::Result;
use crate::models::{
    classify_plan, fuse, plan_text, Classification, ModelResolver, Role, RoleTable,
    SemanticClassifier,
};
use crate::orchestration::collaborators::{
    AnalysisRequest, Analyzer, Coder, DependencyArtifact, Diagnosis, GenerationRequest, Generator,
    PatchRequest, ReviewRequest, Reviewer, Verifier,
};
use crate::orchestration::pool::WorkerPool;
use crate::state::{BuildSnapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::util::write_artifact;
use crate::{flog, flog_debug, flog_error, flog_warn};

const BUDGET_EXHAUSTED: &str = "iteration budget exhausted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Global cap on scheduling rounds.
    pub max_iterations: u32,
    /// Fix attempts a task gets before it is marked failed.
    pub max_task_failures: u32,
    /// Failure count from which fixes use escalated models.
    pub escalate_after: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_task_failures: 3,
            escalate_after: 2,
        }
    }
}

/// The collaborators a pipeline delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub reviewer: Arc<dyn Reviewer>,
    pub verifier: Arc<dyn Verifier>,
    pub analyzer: Arc<dyn Analyzer>,
    pub coder: Arc<dyn Coder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generate,
    Review,
    Verify,
    Fix,
}

/// Events emitted by the pipeline for build and task lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    BuildStarted {
        build_id: Uuid,
        tasks: usize,
        classification: Classification,
    },
    RoundStarted {
        round: u32,
    },
    PhaseStarted {
        round: u32,
        phase: Phase,
        tasks: Vec<TaskId>,
    },
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A fix for this task is using a stronger model.
    TaskEscalated {
        task_id: TaskId,
        role: Role,
        model: String,
    },
    RoundFinished {
        round: u32,
    },
    BuildFinished {
        summary: BuildSummary,
    },
}

/// Point-in-time view of a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub build_id: Option<Uuid>,
    pub round: u32,
    pub phase: Option<Phase>,
    /// Lowest wave index among tasks that are not yet terminal.
    pub wave: Option<usize>,
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    pub counts: BTreeMap<TaskStatus, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: Uuid,
    pub classification: Classification,
    pub verified: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rounds: u32,
    /// Stopped early on request; the snapshot can be resumed.
    pub interrupted: bool,
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        !self.interrupted && self.failed == 0 && self.skipped == 0
    }
}

impl std::fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} verified, {} failed, {} skipped after {} round(s){}",
            self.verified,
            self.failed,
            self.skipped,
            self.rounds,
            if self.interrupted { " (interrupted)" } else { "" }
        )
    }
}

/// Mutable state of one build, owned by the orchestrating task.
struct Build {
    id: Uuid,
    plan_summary: String,
    classification: Classification,
    strict_dependencies: bool,
    round: u32,
    graph: TaskGraph,
    artifacts: BTreeMap<TaskId, String>,
    table: RoleTable,
    waves: BTreeMap<TaskId, usize>,
}

impl Build {
    fn model(&self, role: Role) -> String {
        self.table.get(role).unwrap_or_default().to_string()
    }

    /// Owned copies of the artifacts a task depends on.
    fn dependency_artifacts(&self, id: &TaskId) -> Vec<DependencyArtifact> {
        self.graph
            .dependencies(id)
            .into_iter()
            .filter_map(|dep| {
                self.artifacts.get(&dep.id).map(|content| DependencyArtifact {
                    path: dep.path.clone(),
                    content: content.clone(),
                })
            })
            .collect()
    }

    fn snapshot(&self, root: &Path) -> BuildSnapshot {
        BuildSnapshot {
            version: SNAPSHOT_VERSION,
            build_id: self.id,
            project_root: root.to_path_buf(),
            plan_summary: self.plan_summary.clone(),
            classification: self.classification,
            strict_dependencies: self.strict_dependencies,
            round: self.round,
            tasks: self.graph.to_tasks(),
            artifacts: self.artifacts.clone(),
            saved_at: Utc::now(),
        }
    }

    fn summary(&self, interrupted: bool) -> BuildSummary {
        let counts = self.graph.status_counts();
        BuildSummary {
            build_id: self.id,
            classification: self.classification,
            verified: counts[&TaskStatus::Verified],
            failed: counts[&TaskStatus::Failed],
            skipped: counts[&TaskStatus::Skipped],
            rounds: self.round,
            interrupted,
        }
    }
}

/// Drives a build through generate, review, verify and fix rounds.
///
/// # Example
///
/// ```ignore
/// let pipeline = Pipeline::new(config, pool, resolver, collaborators, &root);
/// let ok = pipeline.run(Plan::load(&plan_path)?).await?;
/// pipeline.shutdown().await;
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    strict_dependencies: bool,
    pool: WorkerPool,
    resolver: ModelResolver,
    collaborators: Collaborators,
    classifier: Option<Arc<dyn SemanticClassifier>>,
    root: PathBuf,
    store: SnapshotStore,
    events: Option<mpsc::Sender<PipelineEvent>>,
    progress: Arc<RwLock<ProgressSnapshot>>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        pool: WorkerPool,
        resolver: ModelResolver,
        collaborators: Collaborators,
        root: &Path,
    ) -> Self {
        Self {
            config,
            strict_dependencies: true,
            pool,
            resolver,
            collaborators,
            classifier: None,
            root: root.to_path_buf(),
            store: SnapshotStore::new(root),
            events: None,
            progress: Arc::new(RwLock::new(ProgressSnapshot::default())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn strict_dependencies(mut self, strict: bool) -> Self {
        self.strict_dependencies = strict;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SemanticClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Report build progress on `events`. Every event is delivered, so the
    /// build waits while the channel is full: the receiver must keep
    /// draining until `BuildFinished` or until the pipeline is dropped.
    pub fn with_events(mut self, events: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that stops the build after the current round, leaving a
    /// resumable snapshot.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Shared progress handle for observers.
    pub fn progress_handle(&self) -> Arc<RwLock<ProgressSnapshot>> {
        Arc::clone(&self.progress)
    }

    pub async fn progress(&self) -> ProgressSnapshot {
        self.progress.read().await.clone()
    }

    /// Run a fresh build. `Ok(true)` when every task was verified.
    ///
    /// # Errors
    ///
    /// Structural plan errors (cycles, duplicate tasks or artifacts, unknown
    /// dependencies in strict mode) and snapshot write failures.
    pub async fn run(&self, plan: Plan) -> Result<bool> {
        Ok(self.run_with_summary(plan).await?.success())
    }

    pub async fn run_with_summary(&self, plan: Plan) -> Result<BuildSummary> {
        let plan_summary = plan.summary.clone();
        let graph = TaskGraph::new(plan.clone().into_tasks())?
            .strict_dependencies(self.strict_dependencies);
        graph.validate()?;

        let keyword = classify_plan(&plan, graph.depth()?);
        let semantic = match &self.classifier {
            Some(classifier) => classifier.classify(&plan_text(&plan)).await,
            None => None,
        };
        let classification = fuse(keyword, semantic);

        let build = self
            .prepare(Uuid::new_v4(), plan_summary, classification, graph, BTreeMap::new(), 0)
            .await?;
        flog!(
            "Build {} started: {} tasks, classification {}",
            build.id,
            build.graph.len(),
            classification
        );
        self.emit(PipelineEvent::BuildStarted {
            build_id: build.id,
            tasks: build.graph.len(),
            classification,
        })
        .await;
        self.drive(build).await
    }

    /// Continue the build saved under the project root.
    ///
    /// # Errors
    ///
    /// `Error::SnapshotNotFound` when there is nothing to resume.
    pub async fn resume(&self) -> Result<bool> {
        Ok(self.resume_with_summary().await?.success())
    }

    pub async fn resume_with_summary(&self) -> Result<BuildSummary> {
        let snapshot = self.store.load().await?;
        let strict = snapshot.strict_dependencies;
        let graph = TaskGraph::new(snapshot.tasks)?.strict_dependencies(strict);
        graph.validate()?;

        let mut build = self
            .prepare(
                snapshot.build_id,
                snapshot.plan_summary,
                snapshot.classification,
                graph,
                snapshot.artifacts,
                snapshot.round,
            )
            .await?;
        build.strict_dependencies = strict;
        flog!(
            "Build {} resumed at round {} ({} tasks)",
            build.id,
            build.round,
            build.graph.len()
        );
        self.drive(build).await
    }

    async fn prepare(
        &self,
        id: Uuid,
        plan_summary: String,
        classification: Classification,
        graph: TaskGraph,
        artifacts: BTreeMap<TaskId, String>,
        round: u32,
    ) -> Result<Build> {
        if let Err(e) = self.resolver.registry().init().await {
            flog_warn!("Could not list available models: {}", e);
        }
        let table = self.resolver.table(classification);
        for (role, model) in table.iter() {
            flog_debug!("Role {} -> {}", role, model);
        }
        let waves = graph.wave_index()?.into_iter().collect();
        let build = Build {
            id,
            plan_summary,
            classification,
            strict_dependencies: self.strict_dependencies,
            round,
            graph,
            artifacts,
            table,
            waves,
        };
        self.publish(&build, None).await;
        Ok(build)
    }

    async fn drive(&self, mut build: Build) -> Result<BuildSummary> {
        let mut interrupted = false;

        while build.round < self.config.max_iterations && !build.graph.all_terminal() {
            if self.cancel.is_cancelled() {
                flog!("Build {} interrupted before round {}", build.id, build.round + 1);
                interrupted = true;
                break;
            }
            build.round += 1;
            let round = build.round;
            flog_debug!("Round {} starting: {:?}", round, build.graph.status_counts());
            self.emit(PipelineEvent::RoundStarted { round }).await;

            let ready = build.graph.ready();
            if ready.is_empty() && !build.graph.any_in_flight() {
                self.skip_blocked(&mut build).await;
                self.store.save(&build.snapshot(&self.root)).await?;
                self.emit(PipelineEvent::RoundFinished { round }).await;
                break;
            }

            self.generate(&mut build, &ready).await;
            if !build.classification.is_lowest() {
                self.review(&mut build).await;
            }
            self.verify(&mut build).await;
            self.fix(&mut build).await;

            self.publish(&build, None).await;
            self.store.save(&build.snapshot(&self.root)).await?;
            self.emit(PipelineEvent::RoundFinished { round }).await;
        }

        if !interrupted && !build.graph.all_terminal() {
            flog_warn!(
                "Build {} hit the iteration cap of {} rounds",
                build.id,
                self.config.max_iterations
            );
            self.exhaust(&mut build).await;
            self.store.save(&build.snapshot(&self.root)).await?;
        }

        self.publish(&build, None).await;
        let summary = build.summary(interrupted);
        flog!("Build {} finished: {}", build.id, summary);
        self.emit(PipelineEvent::BuildFinished {
            summary: summary.clone(),
        })
        .await;
        Ok(summary)
    }

    /// Phase A: one generation job per ready task.
    async fn generate(&self, build: &mut Build, ready: &[TaskId]) {
        if ready.is_empty() {
            return;
        }
        self.phase_started(build, Phase::Generate, ready).await;

        let model = build.model(Role::Generator);
        let mut handles = Vec::with_capacity(ready.len());
        for id in ready {
            let dependencies = build.dependency_artifacts(id);
            let Some(task) = build.graph.get_mut(id) else {
                continue;
            };
            task.start();
            let request = GenerationRequest {
                task_id: *id,
                path: task.path.clone(),
                description: task.description.clone(),
                plan_summary: build.plan_summary.clone(),
                model: model.clone(),
                dependencies,
            };
            let generator = Arc::clone(&self.collaborators.generator);
            handles.push(
                self.pool
                    .submit(*id, async move { generator.generate(&request).await }),
            );
        }
        self.publish(build, Some(Phase::Generate)).await;

        for result in self.pool.collect(handles).await {
            let id = result.task_id;
            let status = match result.outcome {
                Ok(content) => self.store_artifact(build, id, content).await,
                Err(e) => {
                    flog_warn!("Generation failed for task {}: {}", id, e);
                    self.mark(build, id, |t| t.needs_fix(&format!("generation failed: {}", e)))
                }
            };
            if let Some(status) = status {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
        }
    }

    /// Phase B: one review job per generated task.
    async fn review(&self, build: &mut Build) {
        let ids = build.graph.with_status(TaskStatus::Generated);
        if ids.is_empty() {
            return;
        }
        self.phase_started(build, Phase::Review, &ids).await;

        let model = build.model(Role::Reviewer);
        let mut handles = Vec::with_capacity(ids.len());
        for id in &ids {
            let content = build.artifacts.get(id).cloned().unwrap_or_default();
            let Some(task) = build.graph.get_mut(id) else {
                continue;
            };
            task.start_review();
            let request = ReviewRequest {
                task_id: *id,
                path: task.path.clone(),
                description: task.description.clone(),
                content,
                model: model.clone(),
            };
            let reviewer = Arc::clone(&self.collaborators.reviewer);
            handles.push(
                self.pool
                    .submit(*id, async move { reviewer.review(&request).await }),
            );
        }
        self.publish(build, Some(Phase::Review)).await;

        for result in self.pool.collect(handles).await {
            let id = result.task_id;
            let status = match result.outcome {
                Ok(review) if review.approved => self.mark(build, id, |t| t.approve()),
                Ok(review) => {
                    flog_debug!("Review rejected task {}: {}", id, review.summary);
                    self.mark(build, id, |t| t.reject(&review.feedback()))
                }
                Err(e) => {
                    // verification still gates the artifact
                    flog_warn!("Review of task {} failed, keeping artifact: {}", id, e);
                    self.mark(build, id, |t| t.mark_generated())
                }
            };
            if let Some(status) = status {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
        }
    }

    /// Phase C: verify generated tasks in order, on this task.
    async fn verify(&self, build: &mut Build) {
        let ids = build.graph.with_status(TaskStatus::Generated);
        if ids.is_empty() {
            return;
        }
        self.phase_started(build, Phase::Verify, &ids).await;

        for id in ids {
            let Some(path) = build.graph.get(&id).map(|t| t.path.clone()) else {
                continue;
            };
            let status = match build.artifacts.get(&id).cloned() {
                None => self.mark(build, id, |t| t.needs_fix("no artifact to verify")),
                Some(content) => match self.collaborators.verifier.verify(&path, &content).await {
                    Ok(v) if v.passed => self.mark(build, id, |t| t.verify()),
                    Ok(v) => {
                        let summary = v.failure_summary();
                        flog_debug!("Verification failed for task {}: {}", id, summary);
                        self.mark(build, id, |t| t.needs_fix(&summary))
                    }
                    Err(e) => {
                        self.mark(build, id, |t| t.needs_fix(&format!("verifier error: {}", e)))
                    }
                },
            };
            if let Some(status) = status {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
        }
    }

    /// Phase D: fix failing tasks one at a time.
    async fn fix(&self, build: &mut Build) {
        let ids = build.graph.with_status(TaskStatus::NeedsFix);
        if ids.is_empty() {
            return;
        }
        self.phase_started(build, Phase::Fix, &ids).await;
        for id in ids {
            self.fix_task(build, id).await;
            self.publish(build, Some(Phase::Fix)).await;
        }
    }

    async fn fix_task(&self, build: &mut Build, id: TaskId) {
        let Some(task) = build.graph.get_mut(&id) else {
            return;
        };
        let failures = task.record_failure();
        let problem = task.problem().unwrap_or("unknown failure").to_string();
        let path = task.path.clone();
        let description = task.description.clone();

        if failures > self.config.max_task_failures {
            flog_error!(
                "Task {} failed after {} fix attempts: {}",
                id,
                self.config.max_task_failures,
                problem
            );
            let reason = format!(
                "gave up after {} fix attempts: {}",
                self.config.max_task_failures, problem
            );
            if let Some(status) = self.mark(build, id, |t| t.fail(&reason)) {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
            return;
        }

        let escalate = failures >= self.config.escalate_after;
        let analyzer_model = self.model_for(build, id, Role::Analyzer, escalate).await;
        let coder_model = self.model_for(build, id, Role::Coder, escalate).await;
        let content = build.artifacts.get(&id).cloned().unwrap_or_default();
        let dependencies = build.dependency_artifacts(&id);

        let analysis = AnalysisRequest {
            task_id: id,
            path: path.clone(),
            description: description.clone(),
            content: content.clone(),
            error: problem.clone(),
            failures,
            model: analyzer_model,
            dependencies: dependencies.clone(),
        };
        let analyzer = Arc::clone(&self.collaborators.analyzer);
        let handle = self
            .pool
            .submit(id, async move { analyzer.analyze(&analysis).await });
        let diagnosis = match handle.join().await.outcome {
            Ok(diagnosis) => diagnosis,
            Err(e) => {
                flog_warn!("Diagnosis failed for task {}: {}", id, e);
                Diagnosis {
                    root_cause: problem.clone(),
                    fix_strategy: "address the reported problem".to_string(),
                    ..Diagnosis::default()
                }
            }
        };

        let patch = PatchRequest {
            task_id: id,
            path,
            description,
            content,
            error: problem,
            diagnosis,
            model: coder_model,
            dependencies,
        };
        let coder = Arc::clone(&self.collaborators.coder);
        let handle = self
            .pool
            .submit(id, async move { coder.patch(&patch).await });

        let status = match handle.join().await.outcome {
            Ok(content) => self.store_artifact(build, id, content).await,
            Err(e) => {
                flog_warn!("Patch failed for task {}: {}", id, e);
                self.mark(build, id, |t| t.needs_fix(&format!("patch failed: {}", e)))
            }
        };
        if let Some(status) = status {
            self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                .await;
        }
    }

    async fn model_for(&self, build: &Build, id: TaskId, role: Role, escalate: bool) -> String {
        if escalate {
            if let Some(model) = self.resolver.escalate(role, build.classification) {
                flog_debug!("Task {}: escalating {} to {}", id, role, model);
                self.emit(PipelineEvent::TaskEscalated {
                    task_id: id,
                    role,
                    model: model.clone(),
                })
                .await;
                return model;
            }
        }
        build.model(role)
    }

    /// Record new content for a task and write it under the project root.
    async fn store_artifact(
        &self,
        build: &mut Build,
        id: TaskId,
        content: String,
    ) -> Option<TaskStatus> {
        let path = build.graph.get(&id)?.path.clone();
        match write_artifact(&self.root, &path, &content).await {
            Ok(written) => {
                flog_debug!("Wrote {} ({} bytes)", written.display(), content.len());
                build.artifacts.insert(id, content);
                self.mark(build, id, |t| t.mark_generated())
            }
            Err(e) => {
                flog_error!("Could not write artifact for task {}: {}", id, e);
                build.artifacts.insert(id, content);
                self.mark(build, id, |t| t.needs_fix(&format!("could not write artifact: {}", e)))
            }
        }
    }

    /// No task can become ready and nothing is in flight: skip what is left.
    async fn skip_blocked(&self, build: &mut Build) {
        for id in build.graph.with_status(TaskStatus::Pending) {
            let reason = match build.graph.blocking_dependency(&id) {
                Some(dep) => format!("dependency {} ended {}", dep.label(), dep.status),
                None => "never became ready".to_string(),
            };
            flog_warn!("Skipping task {}: {}", id, reason);
            if let Some(status) = self.mark(build, id, |t| t.skip(&reason)) {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
        }
    }

    /// Settle every task left when the iteration budget runs out.
    async fn exhaust(&self, build: &mut Build) {
        for id in build.graph.ids() {
            let status = match build.graph.get(&id).map(|t| t.status) {
                Some(TaskStatus::Pending) => self.mark(build, id, |t| t.skip(BUDGET_EXHAUSTED)),
                Some(s) if !s.is_terminal() => self.mark(build, id, |t| t.fail(BUDGET_EXHAUSTED)),
                _ => None,
            };
            if let Some(status) = status {
                self.emit(PipelineEvent::TaskStatusChanged { task_id: id, status })
                    .await;
            }
        }
    }

    fn mark(
        &self,
        build: &mut Build,
        id: TaskId,
        change: impl FnOnce(&mut Task),
    ) -> Option<TaskStatus> {
        let task = build.graph.get_mut(&id)?;
        change(task);
        Some(task.status)
    }

    async fn phase_started(&self, build: &Build, phase: Phase, tasks: &[TaskId]) {
        flog_debug!("Round {} {:?}: {} task(s)", build.round, phase, tasks.len());
        self.publish(build, Some(phase)).await;
        self.emit(PipelineEvent::PhaseStarted {
            round: build.round,
            phase,
            tasks: tasks.to_vec(),
        })
        .await;
    }

    async fn publish(&self, build: &Build, phase: Option<Phase>) {
        let statuses = build
            .graph
            .tasks()
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect::<BTreeMap<_, _>>();
        let wave = statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .filter_map(|(id, _)| build.waves.get(id).copied())
            .min();
        let mut progress = self.progress.write().await;
        *progress = ProgressSnapshot {
            build_id: Some(build.id),
            round: build.round,
            phase,
            wave,
            statuses,
            counts: build.graph.status_counts(),
        };
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Wait for outstanding jobs and stop the pool monitor.
    pub async fn shutdown(&self) {
        self.pool.shutdown(true).await;
    }
}
