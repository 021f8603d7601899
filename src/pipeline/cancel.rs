use tokio::sync::watch;

use crate::error::BackupError;

/// Observed by the pipeline between steps. Clones share the same source.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// Owner side of a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub const fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// `Err(Cancelled)` if cancellation was requested before `step`.
    pub fn check(&self, step: &'static str) -> Result<(), BackupError> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled { step });
        }
        Ok(())
    }
}

impl CancelHandle {
    /// Request cancellation. Runs stop at their next step boundary.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
