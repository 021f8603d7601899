use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use tracing::info;

use super::{
    Clock, DatabaseKind, DatabaseProvider, DatabaseSpec, ToolCommand, close_connection,
    discard_partial, dump_file_name, open_and_ping,
};
use crate::error::BackupError;

const DEFAULT_PORT: u16 = 5432;

/// PostgreSQL via `pg_dump` (plain SQL) and `psql`.
pub struct PostgresProvider {
    spec: DatabaseSpec,
    clock: Clock,
    conn: Option<PgConnection>,
}

impl std::fmt::Debug for PostgresProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProvider")
            .field("spec", &self.spec)
            .field("connected", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresProvider {
    pub fn new(spec: DatabaseSpec, clock: Clock) -> Self {
        Self {
            spec,
            clock,
            conn: None,
        }
    }

    fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(dsn) = self.spec.dsn() {
            if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
                return PgConnectOptions::from_str(dsn).context("parsing postgres connection URL");
            }
            return parse_keyword_dsn(dsn);
        }

        let mut opts = PgConnectOptions::new()
            .host(self.spec.host_or_localhost())
            .port(self.spec.port_or(DEFAULT_PORT));
        if !self.spec.user.is_empty() {
            opts = opts.username(&self.spec.user);
        }
        if !self.spec.password.is_empty() {
            opts = opts.password(&self.spec.password);
        }
        if !self.spec.dbname.is_empty() {
            opts = opts.database(&self.spec.dbname);
        }
        Ok(opts)
    }

    /// Database named by the DSN or `dbname`; `db` when neither names one.
    fn dump_stem(&self) -> String {
        self.connect_options()
            .ok()
            .and_then(|opts| opts.get_database().map(str::to_string))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "db".to_string())
    }

    /// Flags shared by `pg_dump` and `psql`: either the DSN as the database
    /// argument, or discrete flags with the password in `PGPASSWORD`.
    fn with_target(&self, cmd: ToolCommand) -> ToolCommand {
        if let Some(dsn) = self.spec.dsn() {
            return cmd.arg(dsn).connection_string(dsn);
        }
        cmd.arg("-h")
            .arg(self.spec.host_or_localhost())
            .arg("-p")
            .arg(self.spec.port_or(DEFAULT_PORT).to_string())
            .arg("-U")
            .arg(self.spec.user.as_str())
            .arg("-d")
            .arg(self.spec.dbname.as_str())
            .env("PGPASSWORD", self.spec.password.as_str())
            .secret(self.spec.password.as_str())
    }

    fn dump_command(&self, path: &Path) -> ToolCommand {
        self.with_target(ToolCommand::new("pg_dump"))
            .arg("-f")
            .arg(path.to_string_lossy())
    }

    fn restore_command(&self, source: &Path) -> ToolCommand {
        self.with_target(ToolCommand::new("psql"))
            .args(["-v", "ON_ERROR_STOP=1", "-f"])
            .arg(source.to_string_lossy())
    }
}

#[async_trait]
impl DatabaseProvider for PostgresProvider {
    fn engine(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn connect(&mut self) -> Result<(), BackupError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let options = self.connect_options().map_err(BackupError::Connection)?;
        let conn = open_and_ping::<PgConnection>(self.engine(), &options).await?;
        info!(engine = %self.engine(), "database connection verified");
        self.conn = Some(conn);
        Ok(())
    }

    async fn dump(&self, destination_dir: &Path) -> Result<PathBuf, BackupError> {
        let path = destination_dir.join(dump_file_name(
            &self.dump_stem(),
            self.engine().dump_extension(),
            (self.clock)(),
        ));

        info!(path = %path.display(), "running pg_dump");
        if let Err(e) = self.dump_command(&path).run().await {
            discard_partial(&path).await;
            return Err(BackupError::Dump(e));
        }
        Ok(path)
    }

    async fn restore(&self, source_file: &Path) -> Result<(), BackupError> {
        info!(source = %source_file.display(), "running psql");
        self.restore_command(source_file)
            .run()
            .await
            .map(drop)
            .map_err(BackupError::Restore)
    }

    async fn close(&mut self) -> Result<(), BackupError> {
        close_connection(self.engine(), self.conn.take()).await
    }
}

/// Parse a libpq keyword DSN (`host=db port=5432 user=app dbname=orders`).
fn parse_keyword_dsn(dsn: &str) -> Result<PgConnectOptions> {
    let mut opts = PgConnectOptions::new();
    for pair in dsn.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("malformed postgres DSN entry '{pair}'"))?;
        let value = value.trim_matches('\'');
        opts = match key {
            "host" => opts.host(value),
            "port" => opts.port(
                value
                    .parse()
                    .with_context(|| format!("invalid port '{value}' in postgres DSN"))?,
            ),
            "user" => opts.username(value),
            "password" => opts.password(value),
            "dbname" => opts.database(value),
            "sslmode" => opts.ssl_mode(
                PgSslMode::from_str(value)
                    .map_err(|e| anyhow::anyhow!("invalid sslmode '{value}': {e}"))?,
            ),
            _ => opts,
        };
    }
    Ok(opts)
}
