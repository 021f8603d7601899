use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use mongodb::Client;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use tracing::info;
use url::Url;

use super::{
    Clock, CONNECT_TIMEOUT, DatabaseKind, DatabaseProvider, DatabaseSpec, ToolCommand,
    discard_partial, dump_file_name, redact_dsn,
};
use crate::error::BackupError;

const DEFAULT_PORT: u16 = 27017;

/// MongoDB via `mongodump --archive` and `mongorestore --archive`.
///
/// `connect` opens a driver client and pings `admin`, so bad credentials and
/// unresolvable `mongodb+srv` records fail before any tool runs. The client is
/// held until `close`.
pub struct MongoDbProvider {
    spec: DatabaseSpec,
    clock: Clock,
    connect_timeout: Duration,
    client: Option<Client>,
}

impl std::fmt::Debug for MongoDbProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoDbProvider")
            .field("spec", &self.spec)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl MongoDbProvider {
    pub fn new(spec: DatabaseSpec, clock: Clock) -> Self {
        Self {
            spec,
            clock,
            connect_timeout: CONNECT_TIMEOUT,
            client: None,
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    // With no database named, mongodump exports every database.
    fn dump_stem(&self) -> &str {
        if self.spec.dbname.is_empty() { "all_dbs" } else { &self.spec.dbname }
    }

    /// Connection URI handed to the tools. The DSN is used verbatim; otherwise
    /// `mongodb://[user:pass@]host:port[/db]` is built from the discrete fields.
    fn uri(&self, with_db: bool) -> Result<String> {
        if let Some(dsn) = self.spec.dsn() {
            return Ok(dsn.to_string());
        }
        let mut url = Url::parse(&format!(
            "mongodb://{}:{}",
            self.spec.host_or_localhost(),
            self.spec.port_or(DEFAULT_PORT)
        ))
        .context("building mongodb URI from database.host/port")?;
        if !self.spec.user.is_empty() {
            url.set_username(&self.spec.user)
                .map_err(|()| anyhow!("cannot set username on mongodb URI"))?;
            if !self.spec.password.is_empty() {
                url.set_password(Some(self.spec.password.as_str()))
                    .map_err(|()| anyhow!("cannot set password on mongodb URI"))?;
            }
        }
        if with_db && !self.spec.dbname.is_empty() {
            url.set_path(&format!("/{}", self.spec.dbname));
        }
        Ok(url.to_string())
    }

    fn dump_command(&self, path: &Path) -> Result<ToolCommand> {
        let uri = self.uri(true)?;
        Ok(ToolCommand::new("mongodump")
            .arg(format!("--archive={}", path.display()))
            .arg(format!("--uri={uri}"))
            .connection_string(&uri))
    }

    // Restore omits the database path so the archive's own namespaces apply.
    fn restore_command(&self, source: &Path) -> Result<ToolCommand> {
        let uri = self.uri(false)?;
        Ok(ToolCommand::new("mongorestore")
            .arg(format!("--archive={}", source.display()))
            .arg(format!("--uri={uri}"))
            .connection_string(&uri))
    }
}

// Server selection and socket setup share the caller's budget so a silent
// peer cannot outlive it.
async fn ping(uri: &str, budget: Duration) -> Result<Client> {
    let mut options = ClientOptions::parse(uri)
        .await
        .context("parsing mongodb connection string")?;
    options.server_selection_timeout = Some(budget);
    options.connect_timeout = Some(budget);
    options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
    let client = Client::with_options(options).context("creating mongodb client")?;
    let pinged = client.database("admin").run_command(doc! { "ping": 1 }).await;
    if let Err(e) = pinged {
        client.shutdown().await;
        return Err(anyhow::Error::from(e).context("ping against admin failed"));
    }
    Ok(client)
}

#[async_trait]
impl DatabaseProvider for MongoDbProvider {
    fn engine(&self) -> DatabaseKind {
        DatabaseKind::MongoDb
    }

    async fn connect(&mut self) -> Result<(), BackupError> {
        if self.client.is_some() {
            return Ok(());
        }
        let uri = self.uri(true).map_err(BackupError::Connection)?;
        let shown = redact_dsn(&uri);
        let attempt = tokio::time::timeout(self.connect_timeout, ping(&uri, self.connect_timeout));
        let client = match attempt.await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(BackupError::Connection(
                    e.context(format!("pinging mongodb at {shown}")),
                ));
            }
            Err(_) => {
                return Err(BackupError::Connection(anyhow!(
                    "pinging mongodb at {shown}: timed out after {}s",
                    self.connect_timeout.as_secs_f32()
                )));
            }
        };
        info!(engine = %self.engine(), uri = %shown, "database connection verified");
        self.client = Some(client);
        Ok(())
    }

    async fn dump(&self, destination_dir: &Path) -> Result<PathBuf, BackupError> {
        let path = destination_dir.join(dump_file_name(
            self.dump_stem(),
            self.engine().dump_extension(),
            (self.clock)(),
        ));

        let cmd = self.dump_command(&path).map_err(BackupError::Dump)?;
        info!(path = %path.display(), args = %cmd.display_args(), "running mongodump");
        if let Err(e) = cmd.run().await {
            discard_partial(&path).await;
            return Err(BackupError::Dump(e));
        }
        Ok(path)
    }

    async fn restore(&self, source_file: &Path) -> Result<(), BackupError> {
        let cmd = self.restore_command(source_file).map_err(BackupError::Restore)?;
        info!(source = %source_file.display(), args = %cmd.display_args(), "running mongorestore");
        cmd.run().await.map(drop).map_err(BackupError::Restore)
    }

    async fn close(&mut self) -> Result<(), BackupError> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}
