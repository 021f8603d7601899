pub mod env;

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::DatabaseSpec;
use crate::error::BackupError;
use crate::storage::StorageSpec;

pub use self::env::{ENV_PREFIX, apply_env_overrides, env_key};

/// Process configuration, built once at startup and passed down by reference.
///
/// Sources, lowest to highest precedence:
/// 1. built-in defaults
/// 2. YAML config file (`--config`, or the first of [`default_search_paths`] that exists)
/// 3. `BACKUP_<GROUP>_<FIELD>` environment variables
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseSpec,
    pub storage: StorageSpec,
    pub backup: BackupSettings,
    pub notify: NotifySettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Cron expression used by the `schedule` command.
    pub schedule: String,
    /// Gzip the dump before upload.
    pub compression: bool,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub enabled: bool,
    pub slack_webhook: String,
}

// Webhook URLs embed a secret token.
impl std::fmt::Debug for NotifySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySettings")
            .field("enabled", &self.enabled)
            .field("slack_webhook", &redact(&self.slack_webhook))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `backyard_backup=debug`.
    pub level: String,
    /// Append logs to this file instead of stdout.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl NotifySettings {
    /// Whether a notification should be attempted after a successful backup.
    pub const fn is_active(&self) -> bool {
        self.enabled && !self.slack_webhook.is_empty()
    }
}

impl AppConfig {
    /// Load from file (explicit or discovered) and overlay the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, BackupError> {
        Self::load_with(explicit, &default_search_paths(), |key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with the search path and env lookup supplied by the caller.
    pub fn load_with<F>(
        explicit: Option<&Path>,
        search: &[PathBuf],
        lookup: F,
    ) -> Result<Self, BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match search.iter().find(|p| p.is_file()) {
                Some(path) => Self::from_file(path)?,
                None => {
                    debug!("no config file found; using defaults and environment");
                    Self::default()
                }
            },
        };

        apply_env_overrides(&mut config, lookup)?;
        Ok(config)
    }

    pub const fn database_spec(&self) -> &DatabaseSpec {
        &self.database
    }

    pub const fn storage_spec(&self) -> &StorageSpec {
        &self.storage
    }

    pub fn from_file(path: &Path) -> Result<Self, BackupError> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))
            .map_err(BackupError::Config)?;
        let config = Self::from_yaml_str(&contents)
            .map_err(|e| BackupError::config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, BackupError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
            .context("parsing YAML config")
            .map_err(BackupError::Config)
    }
}

/// Config file locations tried when `--config` is not given.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.yaml"), PathBuf::from("config.yml")];
    if let Ok(home) = std::env::var("HOME")
        && !home.is_empty()
    {
        paths.push(Path::new(&home).join(".backyard-backup").join("config.yaml"));
    }
    paths
}

pub(crate) fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}
