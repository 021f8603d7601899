use std::fmt;

/// Errors surfaced by providers and the backup/restore pipeline.
///
/// Every variant is fatal to the run that produced it; nothing inside a run
/// retries. The wrapped `anyhow::Error` keeps the full context chain,
/// including the combined output of any external tool that failed.
#[derive(Debug)]
pub enum BackupError {
    /// Database ping/handshake failed.
    Connection(anyhow::Error),
    /// The engine's export tool failed or its artifact could not be written.
    Dump(anyhow::Error),
    /// The engine's import tool failed. The target may be partially restored.
    Restore(anyhow::Error),
    /// Writing an artifact to the storage backend failed.
    StorageWrite(anyhow::Error),
    /// Reading an artifact from the storage backend failed (including "not found").
    StorageRead(anyhow::Error),
    Compression(anyhow::Error),
    /// Also raised when the input is not a valid gzip stream.
    Decompression(anyhow::Error),
    /// A `type` tag in the configuration names no known provider.
    UnsupportedType { kind: ProviderKind, tag: String },
    /// A provider was recognized but could not be constructed.
    ProviderInit(anyhow::Error),
    Config(anyhow::Error),
    /// A cancel signal was observed before `step` started.
    Cancelled { step: &'static str },
    /// Another run with the same identity is still active.
    RunInProgress { run_id: String },
}

/// Which provider family a type tag was resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Database,
    Storage,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => f.write_str("database"),
            Self::Storage => f.write_str("storage"),
        }
    }
}

impl BackupError {
    /// Short name of the pipeline step the error belongs to, used as a log field.
    pub const fn step(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connect",
            Self::Dump(_) => "dump",
            Self::Restore(_) => "restore",
            Self::StorageWrite(_) => "upload",
            Self::StorageRead(_) => "download",
            Self::Compression(_) => "compress",
            Self::Decompression(_) => "decompress",
            Self::UnsupportedType { .. } | Self::ProviderInit(_) => "init",
            Self::Config(_) => "config",
            Self::Cancelled { step } => step,
            Self::RunInProgress { .. } => "acquire",
        }
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(anyhow::anyhow!("{msg}"))
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection error: {err:#}"),
            Self::Dump(err) => write!(f, "dump error: {err:#}"),
            Self::Restore(err) => write!(f, "restore error: {err:#}"),
            Self::StorageWrite(err) => write!(f, "storage write error: {err:#}"),
            Self::StorageRead(err) => write!(f, "storage read error: {err:#}"),
            Self::Compression(err) => write!(f, "compression error: {err:#}"),
            Self::Decompression(err) => write!(f, "decompression error: {err:#}"),
            Self::UnsupportedType { kind, tag } => {
                write!(f, "unsupported {kind} type: '{tag}'")
            }
            Self::ProviderInit(err) => write!(f, "provider init error: {err:#}"),
            Self::Config(err) => write!(f, "configuration error: {err:#}"),
            Self::Cancelled { step } => write!(f, "run cancelled before {step}"),
            Self::RunInProgress { run_id } => write!(f, "run '{run_id}' is already in progress"),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(err)
            | Self::Dump(err)
            | Self::Restore(err)
            | Self::StorageWrite(err)
            | Self::StorageRead(err)
            | Self::Compression(err)
            | Self::Decompression(err)
            | Self::ProviderInit(err)
            | Self::Config(err) => Some(err.as_ref()),
            Self::UnsupportedType { .. } | Self::Cancelled { .. } | Self::RunInProgress { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_type_names_the_tag() {
        let err = BackupError::UnsupportedType {
            kind: ProviderKind::Database,
            tag: "oracle".into(),
        };
        assert_eq!(err.to_string(), "unsupported database type: 'oracle'");
        assert_eq!(err.step(), "init");
    }

    #[test]
    fn display_includes_context_chain() {
        let inner = anyhow::anyhow!("exit status: 1, output: pg_dump: connection refused")
            .context("running pg_dump");
        let err = BackupError::Dump(inner);
        let msg = err.to_string();
        assert!(msg.starts_with("dump error: running pg_dump"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn source_is_some_for_wrapped_variants() {
        use std::error::Error;
        let err = BackupError::StorageRead(anyhow::anyhow!("not found"));
        assert!(err.source().is_some());
        assert_eq!(err.step(), "download");

        let err = BackupError::Cancelled { step: "upload" };
        assert!(err.source().is_none());
        assert_eq!(err.step(), "upload");
        assert_eq!(err.to_string(), "run cancelled before upload");
    }

    #[test]
    fn run_in_progress_display() {
        let err = BackupError::RunInProgress {
            run_id: "backup:postgres:orders".into(),
        };
        assert_eq!(
            err.to_string(),
            "run 'backup:postgres:orders' is already in progress"
        );
    }
}
