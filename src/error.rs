use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No usable encryption key: {0}")]
    KeyUnavailable(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Backup password rejected: {0}")]
    BackupPassword(String),

    #[error("Backup file is corrupt: {0}")]
    BackupCorrupt(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] clinic_crypto::CryptoError),
}

impl VaultError {
    /// Attach the offending path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            path: path.into(),
            source,
        }
    }

    /// Fold any codec failure into [`VaultError::Decryption`].
    pub fn decryption(err: impl std::fmt::Display) -> Self {
        VaultError::Decryption(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Failure of a single record or file during migration.
///
/// Collected into reports rather than returned.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[error("{item}: {reason}")]
pub struct MigrationItemError {
    pub item: String,
    pub reason: String,
}

impl MigrationItemError {
    pub fn new(item: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            item: item.into(),
            reason: reason.to_string(),
        }
    }
}
