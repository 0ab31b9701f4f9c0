//! Shared utility functions.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Write an artifact under `root`, creating parent directories.
/// Returns the absolute path written.
pub async fn write_artifact(root: &Path, relative: &Path, content: &str) -> Result<PathBuf> {
    let path = root.join(relative);
    let content = content.to_string();
    blocking(move || {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    })
    .await
}
