//! Database backup and restore: dump a database with its native tooling,
//! optionally gzip the artifact, and ship it to local disk or an S3-compatible
//! object store. The same pipeline pulls an artifact back and restores it.

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod factory;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

pub use self::config::AppConfig;
pub use self::error::BackupError;
pub use self::pipeline::{BackupReport, Pipeline, PipelineState, RestoreReport};
