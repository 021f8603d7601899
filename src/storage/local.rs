use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

use super::{StorageKind, StorageProvider, remove_partial};
use crate::error::BackupError;

/// Stores artifacts on the local filesystem under a base directory.
///
/// Writes go to a `.partial-<uuid>` sibling first and are renamed into place,
/// so an interrupted upload never leaves a complete-looking file at the key.
#[derive(Debug)]
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub const fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Resolve a key under the base directory. Keys may be nested but must stay
    /// inside it.
    fn target(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid storage key '{key}'");
        }
        Ok(self.base_dir.join(rel))
    }

    async fn prepare(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        let dest = self.target(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating storage dir {}", parent.display()))?;
        }
        let mut partial = dest.clone().into_os_string();
        partial.push(format!(".partial-{}", uuid::Uuid::new_v4()));
        Ok((dest, PathBuf::from(partial)))
    }

    async fn commit(partial: &Path, dest: &Path) -> Result<()> {
        tokio::fs::rename(partial, dest)
            .await
            .with_context(|| format!("moving upload into place at {}", dest.display()))
    }

    async fn upload_inner(&self, local_path: &Path, key: &str) -> Result<PathBuf> {
        let (dest, partial) = self.prepare(key).await?;
        let copied = tokio::fs::copy(local_path, &partial)
            .await
            .with_context(|| format!("copying {} to {}", local_path.display(), partial.display()));
        let result = match copied {
            Ok(_) => Self::commit(&partial, &dest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            discard(&partial).await;
            return Err(e);
        }
        Ok(dest)
    }

    async fn stream_inner(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        key: &str,
    ) -> Result<PathBuf> {
        let (dest, partial) = self.prepare(key).await?;
        let written = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .with_context(|| format!("creating {}", partial.display()))?;
            tokio::io::copy(reader, &mut file)
                .await
                .with_context(|| format!("writing {}", partial.display()))?;
            file.flush().await?;
            file.sync_all().await?;
            Self::commit(&partial, &dest).await
        }
        .await;
        if let Err(e) = written {
            discard(&partial).await;
            return Err(e);
        }
        Ok(dest)
    }

    async fn download_inner(&self, key: &str, local_path: &Path) -> Result<()> {
        let source = self.target(key)?;
        let exists = tokio::fs::try_exists(&source)
            .await
            .with_context(|| format!("checking {}", source.display()))?;
        if !exists {
            bail!("object not found: {}", source.display());
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::copy(&source, local_path)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), local_path.display()))?;
        Ok(())
    }
}

async fn discard(partial: &Path) {
    if let Err(e) = remove_partial(partial).await {
        warn!(path = %partial.display(), error = %e, "failed to remove partial upload");
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn backend(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String, BackupError> {
        let dest = self
            .upload_inner(local_path, remote_key)
            .await
            .map_err(BackupError::StorageWrite)?;
        info!(destination = %dest.display(), "stored artifact");
        Ok(dest.to_string_lossy().into_owned())
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<(), BackupError> {
        self.download_inner(remote_key, local_path)
            .await
            .map_err(BackupError::StorageRead)?;
        info!(key = remote_key, destination = %local_path.display(), "fetched artifact");
        Ok(())
    }

    async fn stream_upload(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        remote_key: &str,
    ) -> Result<String, BackupError> {
        let dest = self
            .stream_inner(reader, remote_key)
            .await
            .map_err(BackupError::StorageWrite)?;
        info!(destination = %dest.display(), "stored streamed artifact");
        Ok(dest.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_names(dir: &Path) -> Result<Vec<String>> {
        let mut names = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    #[tokio::test]
    async fn upload_places_file_under_base() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let base = tempfile::tempdir()?;
        let src = scratch.path().join("orders_20240102_030405.sql");
        std::fs::write(&src, "CREATE TABLE orders();")?;

        let storage = LocalStorage::new(base.path().to_path_buf());
        let location = storage.upload(&src, "orders_20240102_030405.sql").await?;

        let expected = base.path().join("orders_20240102_030405.sql");
        assert_eq!(location, expected.to_string_lossy());
        assert_eq!(std::fs::read_to_string(&expected)?, "CREATE TABLE orders();");
        // Source is left alone and no partial file remains.
        assert!(src.exists());
        assert_eq!(file_names(base.path())?, ["orders_20240102_030405.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn upload_creates_intermediate_dirs() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let base = tempfile::tempdir()?;
        let src = scratch.path().join("a.sql");
        std::fs::write(&src, "x")?;

        let storage = LocalStorage::new(base.path().join("nested"));
        storage.upload(&src, "2024/01/a.sql").await?;
        assert!(base.path().join("nested/2024/01/a.sql").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn upload_of_missing_source_leaves_nothing() -> Result<()> {
        let base = tempfile::tempdir()?;
        let storage = LocalStorage::new(base.path().to_path_buf());

        let result = storage.upload(Path::new("/nonexistent/dump.sql"), "dump.sql").await;
        assert!(matches!(result, Err(BackupError::StorageWrite(_))));
        assert!(file_names(base.path())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn download_round_trips_and_missing_is_read_error() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let base = tempfile::tempdir()?;
        std::fs::write(base.path().join("dump.sql"), "payload")?;
        let storage = LocalStorage::new(base.path().to_path_buf());

        let out = scratch.path().join("restore/dump.sql");
        storage.download("dump.sql", &out).await?;
        assert_eq!(std::fs::read_to_string(&out)?, "payload");

        let missing = storage.download("nope.sql", &scratch.path().join("nope.sql")).await;
        assert!(matches!(missing, Err(BackupError::StorageRead(_))));
        Ok(())
    }

    #[tokio::test]
    async fn stream_upload_writes_reader_contents() -> Result<()> {
        let base = tempfile::tempdir()?;
        let storage = LocalStorage::new(base.path().to_path_buf());

        let mut reader: &[u8] = b"streamed bytes";
        let location = storage.stream_upload(&mut reader, "s/streamed.bin").await?;
        assert_eq!(std::fs::read(&location)?, b"streamed bytes");
        Ok(())
    }

    #[tokio::test]
    async fn keys_cannot_escape_base() -> Result<()> {
        let base = tempfile::tempdir()?;
        let storage = LocalStorage::new(base.path().to_path_buf());
        let mut reader: &[u8] = b"x";

        for key in ["../escape.sql", "/etc/passwd", ""] {
            let result = storage.stream_upload(&mut reader, key).await;
            assert!(matches!(result, Err(BackupError::StorageWrite(_))), "{key}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_key_path_is_an_error_not_a_miss() -> Result<()> {
        let base = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        std::fs::write(base.path().join("orders.sql"), "x")?;
        let storage = LocalStorage::new(base.path().to_path_buf());

        // A regular file used as a directory fails the lookup itself.
        let Err(BackupError::StorageRead(e)) =
            storage.download("orders.sql/inner.sql", &scratch.path().join("out.sql")).await
        else {
            anyhow::bail!("lookup through a file must fail");
        };
        let message = format!("{e:#}");
        assert!(message.contains("checking"), "{message}");
        assert!(!message.contains("object not found"), "{message}");
        Ok(())
    }
}
