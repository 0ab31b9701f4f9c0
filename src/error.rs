use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected; unreached tasks: {unreached:?}")]
    Cycle { unreached: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {missing}")]
    DanglingDependency { task: TaskId, missing: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Artifact {path} is produced by both task {first} and task {second}")]
    DuplicateArtifact {
        path: String,
        first: TaskId,
        second: TaskId,
    },

    #[error("Invocation of {model} failed: {message}")]
    Invocation { model: String, message: String },

    #[error("Could not parse model response: {0}")]
    Parse(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("No build snapshot found at {0}")]
    SnapshotNotFound(std::path::PathBuf),
}

impl Error {
    /// Whether this error describes a malformed task graph.
    ///
    /// Structural errors abort a build before any work is scheduled.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. }
                | Error::DanglingDependency { .. }
                | Error::DuplicateTask(_)
                | Error::DuplicateArtifact { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
