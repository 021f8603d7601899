//! Gzip codec for dump artifacts.
//!
//! Both directions stream through fixed-size buffers on the blocking pool, so
//! dumps larger than memory are fine.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::error::BackupError;

/// Suffix that marks a compressed artifact, on disk and in remote keys.
pub const GZIP_SUFFIX: &str = ".gz";

/// Whether a remote key names a compressed artifact. Decided by suffix only.
pub fn is_compressed_key(key: &str) -> bool {
    key.ends_with(GZIP_SUFFIX)
}

/// `dump.sql` → `dump.sql.gz`
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(GZIP_SUFFIX);
    PathBuf::from(name)
}

/// `dump.sql.gz` → `dump.sql`. Names without the suffix are returned unchanged.
pub fn strip_gzip_suffix(name: &str) -> &str {
    name.strip_suffix(GZIP_SUFFIX).unwrap_or(name)
}

/// Gzip `src` into `dst`. `src` is left untouched; a partial `dst` is removed on failure.
pub async fn compress(src: &Path, dst: &Path) -> Result<(), BackupError> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    run_blocking(dst.clone(), move || compress_blocking(&src, &dst))
        .await
        .map_err(BackupError::Compression)
}

/// Gunzip `src` into `dst`. Input that is not a valid gzip stream is a
/// `Decompression` error.
pub async fn decompress(src: &Path, dst: &Path) -> Result<(), BackupError> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    run_blocking(dst.clone(), move || decompress_blocking(&src, &dst))
        .await
        .map_err(BackupError::Decompression)
}

async fn run_blocking<F>(dst: PathBuf, job: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(job)
        .await
        .context("codec task panicked")
        .and_then(|r| r);
    if result.is_err()
        && let Err(e) = tokio::fs::remove_file(&dst).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %dst.display(), error = %e, "failed to remove partial codec output");
    }
    result
}

fn compress_blocking(src: &Path, dst: &Path) -> Result<()> {
    let input = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let output = File::create(dst).with_context(|| format!("creating {}", dst.display()))?;

    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    std::io::copy(&mut BufReader::new(input), &mut encoder)
        .with_context(|| format!("compressing {}", src.display()))?;
    let mut writer = encoder.finish().context("finishing gzip stream")?;
    writer.flush().with_context(|| format!("flushing {}", dst.display()))?;
    Ok(())
}

fn decompress_blocking(src: &Path, dst: &Path) -> Result<()> {
    let input = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let output = File::create(dst).with_context(|| format!("creating {}", dst.display()))?;

    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    std::io::copy(&mut decoder, &mut writer)
        .with_context(|| format!("decompressing {}", src.display()))?;
    writer.flush().with_context(|| format!("flushing {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_is_byte_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let original = dir.path().join("orders.sql");
        let payload: Vec<u8> = b"INSERT INTO orders VALUES (1, 'widget');\n"
            .iter()
            .copied()
            .cycle()
            .take(256 * 1024)
            .collect();
        std::fs::write(&original, &payload)?;

        let gz = compressed_path(&original);
        compress(&original, &gz).await?;
        assert!(std::fs::metadata(&gz)?.len() < payload.len() as u64);
        // Source survives.
        assert_eq!(std::fs::read(&original)?, payload);

        let restored = dir.path().join("restored.sql");
        decompress(&gz, &restored).await?;
        assert_eq!(std::fs::read(&restored)?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn bad_frame_is_decompression_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bogus = dir.path().join("plain.sql.gz");
        std::fs::write(&bogus, "this was never gzipped")?;
        let out = dir.path().join("plain.sql");

        let result = decompress(&bogus, &out).await;
        assert!(matches!(result, Err(BackupError::Decompression(_))));
        assert!(!out.exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_compression_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = compress(&dir.path().join("absent.sql"), &dir.path().join("absent.sql.gz")).await;
        assert!(matches!(result, Err(BackupError::Compression(_))));
        Ok(())
    }

    #[test]
    fn suffix_helpers() {
        assert!(is_compressed_key("foo.sql.gz"));
        assert!(!is_compressed_key("foo.sql"));
        assert!(!is_compressed_key("foo.gzip"));
        assert_eq!(strip_gzip_suffix("foo.sql.gz"), "foo.sql");
        assert_eq!(strip_gzip_suffix("foo.sql"), "foo.sql");
        assert_eq!(
            compressed_path(Path::new("/tmp/x/orders_20240102_030405.sql")),
            PathBuf::from("/tmp/x/orders_20240102_030405.sql.gz")
        );
    }
}
