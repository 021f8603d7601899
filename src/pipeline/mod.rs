//! Backup and restore orchestration.
//!
//! A run is strictly sequential. Backup: `Init → Connected → Dumped →
//! (Compressed) → Uploaded → Done`. Restore: `Init → Connected → Downloaded →
//! (Decompressed) → Restored → Done`. The first failing step moves the run
//! to `Failed`; the database connection is closed and the scratch workspace
//! removed on every path.

mod cancel;
mod guard;
mod workspace;

pub use self::cancel::{CancelHandle, CancelSignal};
pub use self::guard::{RunGuard, RunRegistry};
pub use self::workspace::Workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{Instrument, error, info, info_span, warn};

use crate::archive;
use crate::config::AppConfig;
use crate::db::DatabaseProvider;
use crate::error::BackupError;
use crate::factory;
use crate::notify::{Notifier, SlackNotifier};
use crate::storage::{StorageProvider, key_basename};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Connected,
    Dumped,
    Compressed,
    Uploaded,
    Downloaded,
    Decompressed,
    Restored,
    Done,
    Failed,
}

impl PipelineState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connected => "connected",
            Self::Dumped => "dumped",
            Self::Compressed => "compressed",
            Self::Uploaded => "uploaded",
            Self::Downloaded => "downloaded",
            Self::Decompressed => "decompressed",
            Self::Restored => "restored",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// Key the artifact was stored under; pass it to restore.
    pub remote_key: String,
    /// Where the backend wrote it (path or `s3://` URL).
    pub location: String,
    pub bytes: u64,
    pub compressed: bool,
    pub elapsed: Duration,
    pub state: PipelineState,
}

impl BackupReport {
    /// Human-readable completion line, also used as the notification text.
    pub fn summary(&self) -> String {
        format!("Backup completed successfully in {:.2?}", self.elapsed)
    }
}

/// Outcome of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub remote_key: String,
    pub decompressed: bool,
    pub elapsed: Duration,
    pub state: PipelineState,
}

/// One database paired with one storage backend.
pub struct Pipeline {
    database: Box<dyn DatabaseProvider>,
    storage: Box<dyn StorageProvider>,
    compression: bool,
    notifier: Option<Arc<dyn Notifier>>,
    run_label: String,
    scratch_root: PathBuf,
    registry: RunRegistry,
    cancel: CancelSignal,
    state: PipelineState,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("engine", &self.database.engine())
            .field("storage", &self.storage.backend())
            .field("compression", &self.compression)
            .field("run_label", &self.run_label)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Resolve providers and the notifier from configuration.
    pub fn new(config: &AppConfig) -> Result<Self, BackupError> {
        let database = factory::build_database(config.database_spec())?;
        let storage = factory::build_storage(config.storage_spec())?;

        let mut pipeline = Self::with_providers(database, storage)
            .with_compression(config.backup.compression)
            .with_run_label(run_label_for(config));
        if config.notify.is_active() {
            let slack = SlackNotifier::new(config.notify.slack_webhook.as_str())
                .map_err(BackupError::ProviderInit)?;
            pipeline = pipeline.with_notifier(Arc::new(slack));
        }
        Ok(pipeline)
    }

    /// Pipeline over already-built providers: no compression, no notifier,
    /// scratch space under the system temp dir.
    pub fn with_providers(
        database: Box<dyn DatabaseProvider>,
        storage: Box<dyn StorageProvider>,
    ) -> Self {
        let run_label = database.engine().as_str().to_string();
        Self {
            database,
            storage,
            compression: false,
            notifier: None,
            run_label,
            scratch_root: std::env::temp_dir(),
            registry: RunRegistry::new(),
            cancel: CancelSignal::never(),
            state: PipelineState::Init,
        }
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Name used in the run identity; defaults to the engine tag.
    #[must_use]
    pub fn with_run_label(mut self, label: impl Into<String>) -> Self {
        self.run_label = label.into();
        self
    }

    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Share single-flight state with other pipelines (the scheduler does).
    #[must_use]
    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// `backup:<engine>:<label>` / `restore:<engine>:<label>`
    pub fn run_id(&self, action: &str) -> String {
        format!("{action}:{}:{}", self.database.engine(), self.run_label)
    }

    /// Dump, optionally compress, and upload under the artifact's base name.
    pub async fn run_backup(&mut self) -> Result<BackupReport, BackupError> {
        let run_id = self.run_id("backup");
        let span = info_span!("backup", run_id = %run_id);
        async {
            let _guard = self.registry.acquire(&run_id)?;
            let started = Instant::now();
            self.state = PipelineState::Init;
            info!(engine = %self.database.engine(), storage = %self.storage.backend(), "starting backup");

            let outcome = match self.open(Purpose::Backup).await {
                Ok(workspace) => {
                    let outcome = self.backup_steps(&workspace).await;
                    self.release(workspace).await;
                    outcome
                }
                Err(e) => Err(e),
            };
            let report = self.finish(outcome, |(remote_key, location, bytes, compressed)| {
                BackupReport {
                    remote_key,
                    location,
                    bytes,
                    compressed,
                    elapsed: started.elapsed(),
                    state: PipelineState::Done,
                }
            })?;

            info!(key = %report.remote_key, bytes = report.bytes, elapsed = ?report.elapsed, "{}", report.summary());
            self.send_notification(&report.summary()).await;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Download `remote_key`, decompress it when the key ends in `.gz`, and restore.
    pub async fn run_restore(&mut self, remote_key: &str) -> Result<RestoreReport, BackupError> {
        let run_id = self.run_id("restore");
        let span = info_span!("restore", run_id = %run_id, key = remote_key);
        async {
            let _guard = self.registry.acquire(&run_id)?;
            let started = Instant::now();
            self.state = PipelineState::Init;
            info!(engine = %self.database.engine(), storage = %self.storage.backend(), "starting restore");

            let outcome = if key_basename(remote_key).is_empty() {
                Err(BackupError::StorageRead(anyhow::anyhow!(
                    "remote key '{remote_key}' does not name a file"
                )))
            } else {
                match self.open(Purpose::Restore).await {
                    Ok(workspace) => {
                        let outcome = self.restore_steps(&workspace, remote_key).await;
                        self.release(workspace).await;
                        outcome
                    }
                    Err(e) => Err(e),
                }
            };
            let report = self.finish(outcome, |decompressed| RestoreReport {
                remote_key: remote_key.to_string(),
                decompressed,
                elapsed: started.elapsed(),
                state: PipelineState::Done,
            })?;

            info!(elapsed = ?report.elapsed, "restore completed successfully");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Connect and create a fresh workspace. On failure the connection is
    /// already released.
    async fn open(&mut self, purpose: Purpose) -> Result<Workspace, BackupError> {
        self.cancel.check("connect")?;
        let connected = match purpose {
            Purpose::Backup => self.database.connect().await,
            Purpose::Restore => self.database.connect_for_restore().await,
        };
        if let Err(e) = connected {
            self.close_database().await;
            return Err(e);
        }
        self.transition(PipelineState::Connected);

        match Workspace::create_in(&self.scratch_root).await {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                self.close_database().await;
                Err(match purpose {
                    Purpose::Backup => BackupError::Dump(e),
                    Purpose::Restore => BackupError::StorageRead(e),
                })
            }
        }
    }

    /// Remove the workspace and close the connection. Runs on every exit path.
    async fn release(&mut self, mut workspace: Workspace) {
        if let Err(e) = workspace.cleanup().await {
            let detail = format!("{e:#}");
            warn!(error = %detail, "scratch workspace cleanup failed");
        }
        self.close_database().await;
    }

    async fn backup_steps(
        &mut self,
        workspace: &Workspace,
    ) -> Result<(String, String, u64, bool), BackupError> {
        self.cancel.check("dump")?;
        let dump_path = self.database.dump(workspace.path()).await?;
        self.transition(PipelineState::Dumped);
        info!(path = %dump_path.display(), "database dumped");

        let artifact = if self.compression {
            self.cancel.check("compress")?;
            let gz = archive::compressed_path(&dump_path);
            archive::compress(&dump_path, &gz).await?;
            self.transition(PipelineState::Compressed);
            info!(path = %gz.display(), "dump compressed");
            gz
        } else {
            dump_path
        };

        let bytes = tokio::fs::metadata(&artifact)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        let remote_key = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BackupError::Dump(anyhow::anyhow!(
                    "dump path {} has no file name",
                    artifact.display()
                ))
            })?;

        self.cancel.check("upload")?;
        let location = self.storage.upload(&artifact, &remote_key).await?;
        self.transition(PipelineState::Uploaded);

        Ok((remote_key, location, bytes, self.compression))
    }

    async fn restore_steps(
        &mut self,
        workspace: &Workspace,
        remote_key: &str,
    ) -> Result<bool, BackupError> {
        self.cancel.check("download")?;
        let basename = key_basename(remote_key);
        let downloaded = workspace.join(basename);
        self.storage.download(remote_key, &downloaded).await?;
        self.transition(PipelineState::Downloaded);

        let compressed = archive::is_compressed_key(remote_key);
        let source = if compressed {
            self.cancel.check("decompress")?;
            let name = match archive::strip_gzip_suffix(basename) {
                "" => "artifact",
                name => name,
            };
            let plain = workspace.join(name);
            archive::decompress(&downloaded, &plain).await?;
            self.transition(PipelineState::Decompressed);
            plain
        } else {
            downloaded
        };

        self.cancel.check("restore")?;
        self.database.restore(&source).await?;
        self.transition(PipelineState::Restored);
        Ok(compressed)
    }

    fn finish<T, R>(
        &mut self,
        outcome: Result<T, BackupError>,
        report: impl FnOnce(T) -> R,
    ) -> Result<R, BackupError> {
        match outcome {
            Ok(value) => {
                self.transition(PipelineState::Done);
                Ok(report(value))
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                error!(step = e.step(), error = %e, "run failed");
                Err(e)
            }
        }
    }

    async fn close_database(&mut self) {
        if let Err(e) = self.database.close().await {
            warn!(error = %e, "closing database connection failed");
        }
    }

    async fn send_notification(&self, message: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match notifier.notify(message).await {
            Ok(()) => info!("notification sent"),
            Err(e) => {
                let detail = format!("{e:#}");
                warn!(error = %detail, "notification failed; backup result unaffected");
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        info!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy)]
enum Purpose {
    Backup,
    Restore,
}

fn run_label_for(config: &AppConfig) -> String {
    let db = &config.database;
    if !db.dbname.is_empty() {
        return db.dbname.clone();
    }
    if db.dsn().is_some() {
        return "dsn".to_string();
    }
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseSpec;
    use crate::storage::StorageSpec;

    fn config(db_kind: &str, dbname: &str) -> AppConfig {
        AppConfig {
            database: DatabaseSpec {
                kind: db_kind.into(),
                dbname: dbname.into(),
                ..DatabaseSpec::default()
            },
            storage: StorageSpec {
                kind: "local".into(),
                path: "/backups".into(),
                ..StorageSpec::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn run_identity_uses_engine_and_dbname() -> Result<(), BackupError> {
        let pipeline = Pipeline::new(&config("postgresql", "orders"))?;
        assert_eq!(pipeline.run_id("backup"), "backup:postgres:orders");
        assert_eq!(pipeline.run_id("restore"), "restore:postgres:orders");
        assert_eq!(pipeline.state(), PipelineState::Init);
        Ok(())
    }

    #[test]
    fn unknown_tags_fail_construction() {
        assert!(matches!(
            Pipeline::new(&config("oracle", "orders")),
            Err(BackupError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn summary_reports_elapsed() {
        let report = BackupReport {
            remote_key: "orders.sql".into(),
            location: "/backups/orders.sql".into(),
            bytes: 10,
            compressed: false,
            elapsed: Duration::from_millis(1500),
            state: PipelineState::Done,
        };
        assert_eq!(report.summary(), "Backup completed successfully in 1.50s");
    }
}
