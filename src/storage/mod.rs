//! Storage backends for dump artifacts.

mod local;
#[cfg(feature = "aws")]
mod object_store_backend;

pub use local::LocalStorage;
#[cfg(feature = "aws")]
pub use object_store_backend::ObjectStoreStorage;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncRead;

use crate::error::BackupError;

/// Whole-object transfer of artifacts to and from a backend.
///
/// Keys are relative to the backend's base path or prefix; see [`resolve_key`].
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn backend(&self) -> StorageKind;

    /// Copy `local_path` to `remote_key`. Returns the location written
    /// (a filesystem path or `s3://bucket/key`).
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String, BackupError>;

    /// Copy `remote_key` to `local_path`. A missing object is a `StorageRead` error.
    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<(), BackupError>;

    /// Like [`StorageProvider::upload`] but from an open byte stream.
    async fn stream_upload(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        remote_key: &str,
    ) -> Result<String, BackupError>;
}

/// Supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
}

impl StorageKind {
    /// Every accepted `storage.type` tag, aliases included.
    pub const TAGS: &'static [&'static str] = &["local", "s3", "aws"];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "local" => Some(Self::Local),
            "s3" | "aws" => Some(Self::S3),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the artifact destination (`storage` config group).
///
/// Fields irrelevant to the selected backend are ignored.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Base directory (local) or key prefix (s3).
    pub path: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Custom S3 endpoint, e.g. `http://minio:9000`.
    pub endpoint: String,
}

impl std::fmt::Debug for StorageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSpec")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &crate::config::redact(&self.secret_key))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Join a remote key onto a base path/prefix with `/`.
///
/// An empty base leaves the key untouched.
pub fn resolve_key(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}/{}", key.trim_start_matches('/'))
    }
}

/// Final path component of a key, used as the local file name on download.
pub fn key_basename(key: &str) -> &str {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(key)
}

/// Remove a partially written file. A file that was never created is fine;
/// any other failure is returned for the caller to log.
pub(crate) async fn remove_partial(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
