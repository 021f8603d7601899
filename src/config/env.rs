use std::path::PathBuf;
use std::str::FromStr;

use super::AppConfig;
use crate::error::BackupError;

/// Prefix shared by every configuration environment variable.
pub const ENV_PREFIX: &str = "BACKUP";

/// Map a dotted config key to its environment variable name.
///
/// `storage.access_key` → `BACKUP_STORAGE_ACCESS_KEY`
pub fn env_key(path: &str) -> String {
    format!("{ENV_PREFIX}_{}", path.replace('.', "_").to_uppercase())
}

/// Overlay `BACKUP_*` variables onto `config`. Empty values count as unset.
///
/// Recognized keys:
/// - `database.{type,host,port,user,password,dbname,dsn}`
/// - `storage.{type,path,bucket,region,access_key,secret_key,endpoint}`
/// - `backup.{schedule,compression}`
/// - `notify.{enabled,slack_webhook}`
/// - `log.{level,file}`
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), BackupError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overlay { lookup };

    let db = &mut config.database;
    env.string("database.type", &mut db.kind);
    env.string("database.host", &mut db.host);
    env.parsed("database.port", &mut db.port)?;
    env.string("database.user", &mut db.user);
    env.string("database.password", &mut db.password);
    env.string("database.dbname", &mut db.dbname);
    env.string("database.dsn", &mut db.dsn);

    let storage = &mut config.storage;
    env.string("storage.type", &mut storage.kind);
    env.string("storage.path", &mut storage.path);
    env.string("storage.bucket", &mut storage.bucket);
    env.string("storage.region", &mut storage.region);
    env.string("storage.access_key", &mut storage.access_key);
    env.string("storage.secret_key", &mut storage.secret_key);
    env.string("storage.endpoint", &mut storage.endpoint);

    env.string("backup.schedule", &mut config.backup.schedule);
    env.flag("backup.compression", &mut config.backup.compression)?;

    env.flag("notify.enabled", &mut config.notify.enabled)?;
    env.string("notify.slack_webhook", &mut config.notify.slack_webhook);

    env.string("log.level", &mut config.log.level);
    if let Some(file) = env.get("log.file") {
        config.log.file = Some(PathBuf::from(file));
    }

    Ok(())
}

struct Overlay<F> {
    lookup: F,
}

impl<F> Overlay<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, path: &str) -> Option<String> {
        (self.lookup)(&env_key(path)).filter(|v| !v.is_empty())
    }

    fn string(&self, path: &str, slot: &mut String) {
        if let Some(v) = self.get(path) {
            *slot = v;
        }
    }

    fn parsed<T>(&self, path: &str, slot: &mut T) -> Result<(), BackupError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(v) = self.get(path) {
            *slot = v
                .trim()
                .parse()
                .map_err(|e| BackupError::config(format!("invalid {}: {e}", env_key(path))))?;
        }
        Ok(())
    }

    fn flag(&self, path: &str, slot: &mut bool) -> Result<(), BackupError> {
        if let Some(v) = self.get(path) {
            *slot = parse_bool(&v).ok_or_else(|| {
                BackupError::config(format!(
                    "invalid {}: '{v}' (expected true/false/1/0/yes/no)",
                    env_key(path)
                ))
            })?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_key_uses_prefix_and_underscores() {
        assert_eq!(env_key("database.host"), "BACKUP_DATABASE_HOST");
        assert_eq!(env_key("storage.access_key"), "BACKUP_STORAGE_ACCESS_KEY");
        assert_eq!(env_key("notify.slack_webhook"), "BACKUP_NOTIFY_SLACK_WEBHOOK");
    }

    #[test]
    fn overrides_every_group() -> anyhow::Result<()> {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("BACKUP_DATABASE_TYPE", "mongodb"),
                ("BACKUP_DATABASE_PORT", "27017"),
                ("BACKUP_DATABASE_DSN", "mongodb://db:27017"),
                ("BACKUP_STORAGE_TYPE", "s3"),
                ("BACKUP_STORAGE_SECRET_KEY", "s3cr3t"),
                ("BACKUP_STORAGE_ENDPOINT", "http://minio:9000"),
                ("BACKUP_BACKUP_SCHEDULE", "*/5 * * * *"),
                ("BACKUP_BACKUP_COMPRESSION", "yes"),
                ("BACKUP_NOTIFY_ENABLED", "1"),
                ("BACKUP_NOTIFY_SLACK_WEBHOOK", "https://hooks.example/x"),
                ("BACKUP_LOG_LEVEL", "warn"),
                ("BACKUP_LOG_FILE", "/var/log/backyard.log"),
            ]),
        )?;

        assert_eq!(config.database.kind, "mongodb");
        assert_eq!(config.database.port, 27017);
        assert_eq!(config.database.dsn, "mongodb://db:27017");
        assert_eq!(config.storage.kind, "s3");
        assert_eq!(config.storage.secret_key, "s3cr3t");
        assert_eq!(config.storage.endpoint, "http://minio:9000");
        assert_eq!(config.backup.schedule, "*/5 * * * *");
        assert!(config.backup.compression);
        assert!(config.notify.is_active());
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.file, Some(PathBuf::from("/var/log/backyard.log")));
        Ok(())
    }

    #[test]
    fn empty_values_are_ignored() -> anyhow::Result<()> {
        let mut config = AppConfig::default();
        config.database.host = "keep-me".into();
        apply_env_overrides(&mut config, lookup_from(&[("BACKUP_DATABASE_HOST", "")]))?;
        assert_eq!(config.database.host, "keep-me");
        Ok(())
    }

    #[test]
    fn invalid_port_names_the_variable() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[("BACKUP_DATABASE_PORT", "abc")]))
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("BACKUP_DATABASE_PORT"), "got: {err}");
    }

    #[test]
    fn invalid_flag_is_rejected() {
        let mut config = AppConfig::default();
        let result =
            apply_env_overrides(&mut config, lookup_from(&[("BACKUP_NOTIFY_ENABLED", "maybe")]));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
