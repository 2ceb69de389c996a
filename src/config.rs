//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config
//! and a missing file is never required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Lifetime of a freshly generated key.
pub const DEFAULT_KEY_LIFETIME_DAYS: i64 = 180;

/// Rotate once the current key has this many days or fewer left.
pub const DEFAULT_ROTATION_THRESHOLD_DAYS: i64 = 30;

/// Files migrated per batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Scratch entries older than this are swept.
pub const DEFAULT_SCRATCH_MAX_AGE_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub keys: KeyConfig,
    pub migration: MigrationConfig,
    pub scratch: ScratchConfig,
}

impl VaultConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| VaultError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            VaultError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }
}

/// What to do when the key store file exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptStorePolicy {
    /// Refuse to start.
    #[default]
    Fail,
    /// Move the file aside and generate a new store.
    Rebootstrap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub store_path: PathBuf,
    pub key_lifetime_days: i64,
    pub rotation_threshold_days: i64,
    pub corrupt_store_policy: CorruptStorePolicy,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/encryption_keys.json"),
            key_lifetime_days: DEFAULT_KEY_LIFETIME_DAYS,
            rotation_threshold_days: DEFAULT_ROTATION_THRESHOLD_DAYS,
            corrupt_store_policy: CorruptStorePolicy::Fail,
        }
    }
}

impl KeyConfig {
    /// Defaults with the store at `store_path`.
    pub fn at(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub snapshot_root: PathBuf,
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/clinic.db"),
            data_dir: PathBuf::from("data"),
            snapshot_root: PathBuf::from("migration_backups"),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    pub dir: PathBuf,
    pub max_age_secs: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("clinic-vault"),
            max_age_secs: DEFAULT_SCRATCH_MAX_AGE_SECS,
        }
    }
}

impl ScratchConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: VaultConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.keys.key_lifetime_days, 180);
        assert_eq!(config.keys.rotation_threshold_days, 30);
        assert_eq!(config.keys.corrupt_store_policy, CorruptStorePolicy::Fail);
        assert_eq!(config.migration.batch_size, 50);
        assert_eq!(config.scratch.max_age(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: VaultConfig = serde_json::from_str(
            r#"{"keys": {"store_path": "/tmp/k.json", "corrupt_store_policy": "rebootstrap"}}"#,
        )
        .unwrap();
        assert_eq!(config.keys.store_path, PathBuf::from("/tmp/k.json"));
        assert_eq!(
            config.keys.corrupt_store_policy,
            CorruptStorePolicy::Rebootstrap
        );
        assert_eq!(config.keys.key_lifetime_days, 180);
    }

    #[test]
    fn load_reports_bad_json_as_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            VaultConfig::load(&path),
            Err(VaultError::Configuration(_))
        ));
    }
}
