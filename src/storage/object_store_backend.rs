use std::path::Path as LocalPath;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

use super::{StorageKind, StorageProvider, StorageSpec, remove_partial, resolve_key};
use crate::error::BackupError;

/// Stores artifacts in an S3-compatible bucket (AWS, MinIO, ...).
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for ObjectStoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreStorage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreStorage {
    /// Build an S3 client from the `storage` settings.
    ///
    /// Anything left empty falls back to the standard AWS environment
    /// (`AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_ENDPOINT`, ...).
    pub fn from_spec(spec: &StorageSpec) -> Result<Self> {
        if spec.bucket.trim().is_empty() {
            bail!("storage.bucket is required for the s3 backend");
        }

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&spec.bucket);
        if !spec.region.is_empty() {
            builder = builder.with_region(&spec.region);
        }
        if !spec.access_key.is_empty() {
            builder = builder.with_access_key_id(&spec.access_key);
        }
        if !spec.secret_key.is_empty() {
            builder = builder.with_secret_access_key(&spec.secret_key);
        }
        if !spec.endpoint.is_empty() {
            builder = builder
                .with_endpoint(&spec.endpoint)
                .with_allow_http(spec.endpoint.starts_with("http://"));
        }

        let store = builder.build().context("building S3 object store")?;
        Ok(Self::new(Arc::new(store), &spec.bucket, &spec.path))
    }

    /// Wrap an existing object store (used by tests against MinIO).
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, prefix: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn object_path(&self, key: &str) -> Path {
        Path::from(resolve_key(&self.prefix, key).as_str())
    }

    fn location(&self, path: &Path) -> String {
        format!("s3://{}/{path}", self.bucket)
    }

    /// Multipart upload from `reader`. The upload is aborted on any error so
    /// no object becomes visible at the key.
    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &Path,
    ) -> Result<()> {
        let mut writer = BufWriter::new(Arc::clone(&self.store), path.clone());
        let written = async {
            tokio::io::copy(reader, &mut writer).await?;
            writer.shutdown().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = written {
            if let Err(abort_err) = writer.abort().await {
                warn!(key = %path, error = %abort_err, "failed to abort multipart upload");
            }
            return Err(anyhow::Error::new(e).context(format!("writing object {path}")));
        }
        Ok(())
    }

    async fn fetch(&self, path: &Path, local_path: &LocalPath) -> Result<()> {
        let result = self.store.get(path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                anyhow::anyhow!("object not found: {}", self.location(path))
            }
            other => anyhow::Error::new(other).context(format!("reading object {path}")),
        })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("creating {}", local_path.display()))?;
        let mut body = result.into_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("streaming object {path}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", local_path.display()))?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreStorage {
    fn backend(&self) -> StorageKind {
        StorageKind::S3
    }

    async fn upload(&self, local_path: &LocalPath, remote_key: &str) -> Result<String, BackupError> {
        let path = self.object_path(remote_key);
        let mut file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("opening {}", local_path.display()))
            .map_err(BackupError::StorageWrite)?;
        self.put_stream(&mut file, &path)
            .await
            .map_err(BackupError::StorageWrite)?;

        let location = self.location(&path);
        info!(%location, "stored artifact");
        Ok(location)
    }

    async fn download(&self, remote_key: &str, local_path: &LocalPath) -> Result<(), BackupError> {
        let path = self.object_path(remote_key);
        if let Err(e) = self.fetch(&path, local_path).await {
            // Do not leave a truncated file behind for the restore step.
            if let Err(cleanup) = remove_partial(local_path).await {
                warn!(path = %local_path.display(), error = %cleanup, "failed to remove partial download");
            }
            return Err(BackupError::StorageRead(e));
        }
        info!(location = %self.location(&path), destination = %local_path.display(), "fetched artifact");
        Ok(())
    }

    async fn stream_upload(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        remote_key: &str,
    ) -> Result<String, BackupError> {
        let path = self.object_path(remote_key);
        self.put_stream(reader, &path)
            .await
            .map_err(BackupError::StorageWrite)?;

        let location = self.location(&path);
        info!(%location, "stored streamed artifact");
        Ok(location)
    }
}
