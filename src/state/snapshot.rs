//! Build snapshots under `<project>/.foundry/build.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::models::Classification;
use crate::util::blocking;
use crate::{flog_debug, Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to continue a build after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub version: u32,
    pub build_id: Uuid,
    pub project_root: PathBuf,
    #[serde(default)]
    pub plan_summary: String,
    pub classification: Classification,
    #[serde(default = "default_strict")]
    pub strict_dependencies: bool,
    /// Rounds completed so far.
    pub round: u32,
    pub tasks: Vec<Task>,
    /// Current artifact content per task.
    #[serde(default)]
    pub artifacts: BTreeMap<TaskId, String>,
    pub saved_at: DateTime<Utc>,
}

fn default_strict() -> bool {
    true
}

impl BuildSnapshot {
    /// Turn statuses that only exist mid-phase back into their resting
    /// state: `InProgress` restarts generation, `Reviewing` re-enters review.
    /// Returns how many tasks changed.
    pub fn normalize(&mut self) -> usize {
        let mut changed = 0;
        for task in &mut self.tasks {
            let resting = match task.status {
                TaskStatus::InProgress => TaskStatus::Pending,
                TaskStatus::Reviewing => TaskStatus::Generated,
                other => other,
            };
            if resting != task.status {
                flog_debug!("Snapshot: task {} {} -> {}", task.id, task.status, resting);
                task.status = resting;
                changed += 1;
            }
        }
        changed
    }

    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }
}

/// Reads and writes the snapshot of one project.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".foundry").join("build.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write through a temp file and rename, so readers never see a
    /// partial snapshot.
    pub async fn save(&self, snapshot: &BuildSnapshot) -> Result<()> {
        flog_debug!(
            "SnapshotStore::save round={} tasks={}",
            snapshot.round,
            snapshot.tasks.len()
        );
        let contents = serde_json::to_string_pretty(snapshot)?;
        let path = self.path.clone();

        blocking(move || {
            if let Some(dir) = path.parent() {
                if !dir.exists() {
                    flog_debug!("Creating snapshot directory: {}", dir.display());
                    fs::create_dir_all(dir)?;
                }
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            flog_debug!("Snapshot saved: {}", path.display());
            Ok(())
        })
        .await
    }

    /// Load and normalize the snapshot.
    ///
    /// # Errors
    /// `Error::SnapshotNotFound` if nothing was saved yet.
    pub async fn load(&self) -> Result<BuildSnapshot> {
        let path = self.path.clone();
        blocking(move || {
            if !path.exists() {
                return Err(Error::SnapshotNotFound(path));
            }
            let mut snapshot: BuildSnapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if snapshot.version > SNAPSHOT_VERSION {
                return Err(Error::Validation(format!(
                    "snapshot version {} is newer than supported version {}",
                    snapshot.version, SNAPSHOT_VERSION
                )));
            }
            let changed = snapshot.normalize();
            flog_debug!(
                "Snapshot loaded: {} tasks, round {}, {} normalized",
                snapshot.tasks.len(),
                snapshot.round,
                changed
            );
            Ok(snapshot)
        })
        .await
    }

    pub async fn remove(&self) -> Result<()> {
        let path = self.path.clone();
        blocking(move || {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            Ok(())
        })
        .await
    }
}
