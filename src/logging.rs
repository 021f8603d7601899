//! Process-wide `tracing` setup. Call [`init`] once, before anything logs,
//! and keep the returned guard alive until exit.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;
use crate::error::BackupError;

/// Flushes the log file (if any) when dropped.
#[derive(Debug)]
pub struct LogGuard {
    file: Option<Arc<File>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = (&**file).flush();
            let _ = file.sync_all();
        }
    }
}

/// Install the global subscriber: `RUST_LOG` when set, else `log.level`;
/// output to stdout, or appended to `log.file` without ANSI colors.
pub fn init(config: &LogConfig) -> Result<LogGuard, BackupError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), &config.level)?;

    let file = config.file.as_deref().map(open_log_file).transpose()?;
    let (stdout_layer, file_layer) = match &file {
        Some(file) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::clone(file)),
            ),
        ),
        None => (Some(tracing_subscriber::fmt::layer()), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("installing log subscriber")
        .map_err(BackupError::Config)?;

    Ok(LogGuard { file })
}

fn build_filter(rust_log: Option<&str>, level: &str) -> Result<EnvFilter, BackupError> {
    let directives = match rust_log {
        Some(env) if !env.trim().is_empty() => env,
        _ if level.trim().is_empty() => "info",
        _ => level,
    };
    EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log filter '{directives}'"))
        .map_err(BackupError::Config)
}

fn open_log_file(path: &Path) -> Result<Arc<File>, BackupError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))
            .map_err(BackupError::Config)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
        .map_err(BackupError::Config)?;
    Ok(Arc::new(file))
}
