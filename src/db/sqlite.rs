use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tracing::info;

use super::{
    Clock, DatabaseKind, DatabaseProvider, DatabaseSpec, ToolCommand, close_connection,
    discard_partial, dump_file_name, open_and_ping,
};
use crate::error::BackupError;

/// SQLite via the `sqlite3` shell. The database is a local file; host, port
/// and credentials are ignored.
pub struct SqliteProvider {
    spec: DatabaseSpec,
    clock: Clock,
    conn: Option<SqliteConnection>,
}

impl std::fmt::Debug for SqliteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProvider")
            .field("spec", &self.spec)
            .field("connected", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteProvider {
    pub fn new(spec: DatabaseSpec, clock: Clock) -> Self {
        Self {
            spec,
            clock,
            conn: None,
        }
    }

    /// Database file path: the DSN (with any `sqlite:` scheme stripped) or `dbname`.
    fn db_path(&self) -> Result<PathBuf> {
        let raw = match self.spec.dsn() {
            Some(dsn) => dsn
                .strip_prefix("sqlite://")
                .or_else(|| dsn.strip_prefix("sqlite:"))
                .unwrap_or(dsn),
            None => self.spec.dbname.trim(),
        };
        if raw.is_empty() {
            bail!("sqlite database path is required (set database.dbname or database.dsn)");
        }
        Ok(PathBuf::from(raw))
    }

    /// Open and ping the file. With `create`, a missing file is created empty
    /// so a restore can populate it.
    async fn open_file(&mut self, create: bool) -> Result<(), BackupError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let path = self.db_path().map_err(BackupError::Connection)?;
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(create);
        let conn = open_and_ping::<SqliteConnection>(self.engine(), &options).await?;
        info!(engine = %self.engine(), path = %path.display(), "database connection verified");
        self.conn = Some(conn);
        Ok(())
    }

    fn dump_command(db: &Path, out: &Path) -> ToolCommand {
        ToolCommand::new("sqlite3")
            .arg(db.to_string_lossy())
            .arg(".dump")
            .stdout_to(out)
    }

    fn restore_command(db: &Path, source: &Path) -> ToolCommand {
        ToolCommand::new("sqlite3")
            .arg(db.to_string_lossy())
            .stdin_from(source)
    }
}

#[async_trait]
impl DatabaseProvider for SqliteProvider {
    fn engine(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    async fn connect(&mut self) -> Result<(), BackupError> {
        // A mistyped path must not turn into an empty dump.
        self.open_file(false).await
    }

    async fn connect_for_restore(&mut self) -> Result<(), BackupError> {
        self.open_file(true).await
    }

    async fn dump(&self, destination_dir: &Path) -> Result<PathBuf, BackupError> {
        let db = self.db_path().map_err(BackupError::Dump)?;
        let stem = db
            .file_stem()
            .map_or_else(|| "db".to_string(), |s| s.to_string_lossy().into_owned());
        let path = destination_dir.join(dump_file_name(
            &stem,
            self.engine().dump_extension(),
            (self.clock)(),
        ));

        info!(path = %path.display(), "running sqlite3 .dump");
        if let Err(e) = Self::dump_command(&db, &path).run().await {
            discard_partial(&path).await;
            return Err(BackupError::Dump(e));
        }
        Ok(path)
    }

    async fn restore(&self, source_file: &Path) -> Result<(), BackupError> {
        let db = self.db_path().map_err(BackupError::Restore)?;
        info!(source = %source_file.display(), target = %db.display(), "running sqlite3");
        Self::restore_command(&db, source_file)
            .run()
            .await
            .map(drop)
            .map_err(BackupError::Restore)
    }

    async fn close(&mut self) -> Result<(), BackupError> {
        close_connection(self.engine(), self.conn.take()).await
    }
}
