//! Password-protected key backups.
//!
//! Layout: [32 bytes: PBKDF2 salt][12 bytes: nonce][AES-256-GCM ciphertext + tag]
//!
//! The plaintext is a JSON document holding every key record and the
//! current key pointer. The master key is never written to a backup.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use clinic_crypto::{
    derive_key_from_password, random_bytes, AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH,
    PBKDF2_SALT_LENGTH,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::fs::write_atomic;
use crate::keys::{KeyRecord, KeyStore};

pub const BACKUP_VERSION: &str = "1.0";

/// Shortest accepted backup password, in characters.
pub const MIN_PASSWORD_CHARS: usize = 12;

#[derive(Serialize, Deserialize)]
struct BackupDocument {
    keys: BTreeMap<String, KeyRecord>,
    current_key_id: Option<String>,
    backup_created: DateTime<Utc>,
    version: String,
}

/// Reject passwords shorter than [`MIN_PASSWORD_CHARS`].
pub fn check_password(password: &str) -> Result<()> {
    let chars = password.chars().count();
    if chars < MIN_PASSWORD_CHARS {
        return Err(VaultError::BackupPassword(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters, got {chars}"
        )));
    }
    Ok(())
}

/// Encrypt every key in `store` under `password` and write it to `path`.
///
/// The password is checked before anything touches the filesystem.
pub fn write_backup(
    store: &KeyStore,
    path: &Path,
    password: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    check_password(password)?;

    let document = BackupDocument {
        keys: store
            .keys()
            .map(|record| (record.key_id.clone(), record.clone()))
            .collect(),
        current_key_id: store.current_key_id().map(str::to_owned),
        backup_created: now,
        version: BACKUP_VERSION.to_string(),
    };
    let plaintext = Zeroizing::new(serde_json::to_vec(&document)?);

    let salt = random_bytes::<PBKDF2_SALT_LENGTH>()?;
    let key = derive_key_from_password(password, &salt)?;
    let sealed = clinic_crypto::seal(&key[..], &plaintext)?;

    let mut contents = Vec::with_capacity(salt.len() + sealed.len());
    contents.extend_from_slice(&salt);
    contents.extend_from_slice(&sealed);
    write_atomic(path, &contents)?;

    info!(
        path = %path.display(),
        keys = document.keys.len(),
        "Wrote key backup"
    );
    Ok(())
}

/// Decrypt the backup at `path` into a validated store without a master key.
pub fn read_backup(path: &Path, password: &str) -> Result<KeyStore> {
    let contents = std::fs::read(path).map_err(|e| VaultError::io(path, e))?;
    let min_length = PBKDF2_SALT_LENGTH + AES_GCM_NONCE_LENGTH + AES_GCM_TAG_LENGTH;
    if contents.len() < min_length {
        return Err(VaultError::BackupCorrupt(format!(
            "{} is {} bytes, expected at least {min_length}",
            path.display(),
            contents.len()
        )));
    }

    let (salt, sealed) = contents.split_at(PBKDF2_SALT_LENGTH);
    let key = derive_key_from_password(password, salt)?;
    let plaintext = Zeroizing::new(clinic_crypto::open(&key[..], sealed).map_err(|_| {
        warn!(path = %path.display(), "Key backup failed authentication");
        VaultError::BackupPassword("wrong password or corrupted backup".into())
    })?);

    let document: BackupDocument = serde_json::from_slice(&plaintext)
        .map_err(|e| VaultError::BackupCorrupt(format!("invalid backup document: {e}")))?;
    if document.version != BACKUP_VERSION {
        return Err(VaultError::BackupCorrupt(format!(
            "unsupported backup version {}",
            document.version
        )));
    }

    KeyStore::from_records(document.keys.into_values(), document.current_key_id, None)
        .map_err(|e| VaultError::BackupCorrupt(e.to_string()))
}
