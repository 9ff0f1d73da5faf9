use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LearnboxError, Result};

/// Per-execution scratch directory at `<root>/<sandbox_id>`.
///
/// The directory is removed when the handle is dropped, so every exit path
/// of an execution (including panics and cancelled futures) cleans up.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create the workspace directory for `sandbox_id` under `root`.
    pub async fn create(root: &Path, sandbox_id: &str) -> Result<Self> {
        let path = root.join(sandbox_id);
        tokio::fs::create_dir_all(&path).await.map_err(|source| LearnboxError::Workspace {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Workspace created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Drop cannot await, so removal blocks the current worker briefly.
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Workspace destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // Never allowed to mask the execution result.
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}
