//! Tag-based construction of database and storage providers.

use std::path::PathBuf;

use crate::db::{
    Clock, DatabaseKind, DatabaseProvider, DatabaseSpec, MongoDbProvider, MySqlProvider,
    PostgresProvider, SqliteProvider, system_clock,
};
use crate::error::{BackupError, ProviderKind};
use crate::storage::{LocalStorage, StorageKind, StorageProvider, StorageSpec};

/// Build the database provider named by `spec.kind`, stamping dumps with the wall clock.
pub fn build_database(spec: &DatabaseSpec) -> Result<Box<dyn DatabaseProvider>, BackupError> {
    build_database_with_clock(spec, system_clock())
}

pub fn build_database_with_clock(
    spec: &DatabaseSpec,
    clock: Clock,
) -> Result<Box<dyn DatabaseProvider>, BackupError> {
    let kind = DatabaseKind::from_tag(&spec.kind).ok_or_else(|| BackupError::UnsupportedType {
        kind: ProviderKind::Database,
        tag: spec.kind.clone(),
    })?;
    let spec = spec.clone();
    Ok(match kind {
        DatabaseKind::Postgres => Box::new(PostgresProvider::new(spec, clock)),
        DatabaseKind::MySql => Box::new(MySqlProvider::new(spec, clock)),
        DatabaseKind::Sqlite => Box::new(SqliteProvider::new(spec, clock)),
        DatabaseKind::MongoDb => Box::new(MongoDbProvider::new(spec, clock)),
    })
}

/// Build the storage provider named by `spec.kind`.
///
/// The s3 backend needs the `aws` feature; without it the tag is still
/// recognized but construction fails with `ProviderInit`.
pub fn build_storage(spec: &StorageSpec) -> Result<Box<dyn StorageProvider>, BackupError> {
    let kind = StorageKind::from_tag(&spec.kind).ok_or_else(|| BackupError::UnsupportedType {
        kind: ProviderKind::Storage,
        tag: spec.kind.clone(),
    })?;
    match kind {
        StorageKind::Local => {
            let base = if spec.path.is_empty() { "." } else { spec.path.as_str() };
            Ok(Box::new(LocalStorage::new(PathBuf::from(base))))
        }
        StorageKind::S3 => build_s3(spec),
    }
}

#[cfg(feature = "aws")]
fn build_s3(spec: &StorageSpec) -> Result<Box<dyn StorageProvider>, BackupError> {
    let storage =
        crate::storage::ObjectStoreStorage::from_spec(spec).map_err(BackupError::ProviderInit)?;
    Ok(Box::new(storage))
}

#[cfg(not(feature = "aws"))]
fn build_s3(_spec: &StorageSpec) -> Result<Box<dyn StorageProvider>, BackupError> {
    Err(BackupError::ProviderInit(anyhow::anyhow!(
        "the s3 storage backend requires the 'aws' feature flag"
    )))
}
