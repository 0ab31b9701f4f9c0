//! Task data model for the build graph.
//!
//! A task produces exactly one artifact (usually a source file). Tasks carry
//! their own status and the feedback accumulated while moving through the
//! generate, review, verify and fix phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Identifier of a task within a plan.
///
/// Ids come from the materialized plan and are only unique within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// Pending -> InProgress -> Generated -> [Reviewing ->] Verified | NeedsFix
/// NeedsFix -> Generated (after a patch) | Failed
/// Pending -> Skipped
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its dependencies.
    #[default]
    Pending,
    /// Generation job submitted.
    InProgress,
    /// An artifact exists and awaits review or verification.
    Generated,
    /// Review job submitted.
    Reviewing,
    /// Passed verification.
    Verified,
    /// Failed a phase; will be diagnosed and patched.
    NeedsFix,
    /// Exceeded its failure budget.
    Failed,
    /// Never became ready (an upstream task failed or deadlocked).
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Generated,
        TaskStatus::Reviewing,
        TaskStatus::Verified,
        TaskStatus::NeedsFix,
        TaskStatus::Failed,
        TaskStatus::Skipped,
    ];

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Verified | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// A task in flight has produced (or is producing) work that a later
    /// round will still act on.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::InProgress
                | TaskStatus::Generated
                | TaskStatus::Reviewing
                | TaskStatus::NeedsFix
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Generated => "generated",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Verified => "verified",
            TaskStatus::NeedsFix => "needs_fix",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single file-production task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Artifact produced by this task, relative to the project root.
    pub path: PathBuf,
    pub description: String,
    /// Ordered, de-duplicated dependency ids.
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    /// Number of times the fix phase has picked this task up.
    pub failures: u32,
    /// Most recent reviewer feedback.
    pub feedback: Option<String>,
    /// Most recent error summary (generation, verification or patch).
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Artifact paths must be non-empty, relative, and free of `..`, so that
/// every write lands inside the project root.
pub fn check_artifact_path(id: TaskId, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Validation(format!("Task {} has an empty path", id)));
    }
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::Validation(format!(
            "Task {} path {} escapes the project root",
            id,
            path.display()
        )));
    }
    Ok(())
}

impl Task {
    /// Create a pending task. Duplicate dependency ids are dropped, keeping
    /// the first occurrence.
    pub fn new(
        id: TaskId,
        path: impl Into<PathBuf>,
        description: &str,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        let mut deps = Vec::new();
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            id,
            path: path.into(),
            description: description.to_string(),
            dependencies: deps,
            status: TaskStatus::Pending,
            failures: 0,
            feedback: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Display label: `#id path`.
    pub fn label(&self) -> String {
        format!("#{} {}", self.id, self.path.display())
    }

    /// Generation was submitted.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// An artifact was produced (by generation or by a patch).
    pub fn mark_generated(&mut self) {
        self.status = TaskStatus::Generated;
    }

    pub fn start_review(&mut self) {
        self.status = TaskStatus::Reviewing;
    }

    /// Review approved; the task waits for verification.
    pub fn approve(&mut self) {
        self.status = TaskStatus::Generated;
        self.feedback = None;
    }

    /// Review rejected the artifact.
    pub fn reject(&mut self, feedback: &str) {
        self.status = TaskStatus::NeedsFix;
        self.feedback = Some(feedback.to_string());
    }

    /// A phase failed with an error summary.
    pub fn needs_fix(&mut self, error: &str) {
        self.status = TaskStatus::NeedsFix;
        self.last_error = Some(error.to_string());
    }

    pub fn verify(&mut self) {
        self.status = TaskStatus::Verified;
        self.last_error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped;
        self.last_error = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
    }

    /// Record another trip through the fix phase and return the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Most useful description of what went wrong, feedback first.
    pub fn problem(&self) -> Option<&str> {
        self.feedback.as_deref().or(self.last_error.as_deref())
    }
}
