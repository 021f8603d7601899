use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Per-run scratch directory for dump and download artifacts.
///
/// Call [`Workspace::cleanup`] on every exit path; `Drop` removes the
/// directory synchronously as a fallback if that was skipped.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create `backyard-backup-<uuid>` under `parent`.
    pub async fn create_in(parent: &Path) -> Result<Self> {
        let path = parent.join(format!("backyard-backup-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating scratch workspace {}", path.display()))?;
        debug!(path = %path.display(), "created scratch workspace");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it. Safe to call repeatedly and
    /// on a directory that is already partly or fully gone.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("removing scratch workspace {}", self.path.display())));
            }
        }
        self.removed = true;
        debug!(path = %self.path.display(), "removed scratch workspace");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove scratch workspace");
        }
    }
}
