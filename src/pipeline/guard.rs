use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::BackupError;

/// Process-wide record of active runs, keyed on run identity
/// (`backup:<engine>:<name>`, `restore:<engine>:<name>`).
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Marks a run as active until dropped.
#[derive(Debug)]
pub struct RunGuard {
    run_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `run_id`, or fail with `RunInProgress` if it is already held.
    pub fn acquire(&self, run_id: &str) -> Result<RunGuard, BackupError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(run_id.to_string()) {
            return Err(BackupError::RunInProgress {
                run_id: run_id.to_string(),
            });
        }
        Ok(RunGuard {
            run_id: run_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run_id)
    }
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}
