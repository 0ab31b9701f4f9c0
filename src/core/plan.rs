//! Materialized build plans.
//!
//! A plan is the JSON handed to `foundry run`: a short project summary and
//! the list of file-production tasks.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::{check_artifact_path, Task, TaskId};
use crate::{flog_debug, Result};

/// One task entry as written in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: TaskId,
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Free-text project description, also used for workload classification.
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<PlannedTask>,
}

impl Plan {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            tasks: Vec::new(),
        }
    }

    /// Builder-style helper used by tests and embedders.
    pub fn with_task(
        mut self,
        id: u32,
        path: &str,
        description: &str,
        dependencies: &[u32],
    ) -> Self {
        self.tasks.push(PlannedTask {
            id: TaskId(id),
            path: PathBuf::from(path),
            description: description.to_string(),
            dependencies: dependencies.iter().copied().map(TaskId).collect(),
        });
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        flog_debug!("Plan::load path={}", path.display());
        let plan: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        plan.check_paths()?;
        Ok(plan)
    }

    /// Artifact paths must stay inside the project root.
    fn check_paths(&self) -> Result<()> {
        self.tasks
            .iter()
            .try_for_each(|task| check_artifact_path(task.id, &task.path))
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
            .into_iter()
            .map(|t| Task::new(t.id, t.path, &t.description, t.dependencies))
            .collect()
    }
}
