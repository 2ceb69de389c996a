//! `KeyManager`: sole owner of the key store.
//!
//! Readers take the lock only long enough to clone a `KeyRecord`; cipher
//! work never happens under the lock. Rotation and restore persist while
//! holding the write lock, so on-disk order always matches memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::record::KeyRecord;
use super::store::KeyStore;
use super::KeyProvider;
use crate::backup::{read_backup, write_backup};
use crate::cipher::{EncryptedFile, FieldCipher, FileCipher};
use crate::config::{CorruptStorePolicy, KeyConfig};
use crate::error::{Result, VaultError};

/// Per-key entry of [`KeyInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub days_until_expiry: i64,
}

/// Key store overview. Contains no key material.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub current_key_id: Option<String>,
    pub total_keys: usize,
    pub active_keys: usize,
    pub rotation_days: i64,
    pub keys: BTreeMap<String, KeySummary>,
}

pub struct KeyManager {
    config: KeyConfig,
    store: RwLock<KeyStore>,
}

impl KeyManager {
    /// Load the store, bootstrapping it on first run, then rotate if due.
    pub fn open(config: KeyConfig) -> Result<Self> {
        Self::open_at(config, Utc::now())
    }

    /// [`KeyManager::open`] with an explicit clock reading.
    pub fn open_at(config: KeyConfig, now: DateTime<Utc>) -> Result<Self> {
        let store = match KeyStore::load(&config.store_path) {
            Ok(Some(store)) => {
                debug!(
                    path = %config.store_path.display(),
                    keys = store.len(),
                    "Loaded key store"
                );
                store
            }
            Ok(None) => Self::bootstrap(&config, now)?,
            Err(VaultError::Configuration(reason)) => match config.corrupt_store_policy {
                CorruptStorePolicy::Fail => {
                    error!(path = %config.store_path.display(), %reason, "Key store unreadable");
                    return Err(VaultError::Configuration(reason));
                }
                CorruptStorePolicy::Rebootstrap => {
                    let aside = quarantine(&config.store_path, now)?;
                    warn!(
                        path = %config.store_path.display(),
                        moved_to = %aside.display(),
                        %reason,
                        "Key store unreadable, moved aside and starting a new one"
                    );
                    Self::bootstrap(&config, now)?
                }
            },
            Err(e) => return Err(e),
        };

        let manager = Self {
            config,
            store: RwLock::new(store),
        };
        manager.check_rotation_at(now)?;
        Ok(manager)
    }

    /// Create and persist a first-run store at the configured path.
    pub fn bootstrap(config: &KeyConfig, now: DateTime<Utc>) -> Result<KeyStore> {
        let store = KeyStore::bootstrap(now, config.key_lifetime_days)?;
        store.persist(&config.store_path, now)?;
        info!(
            path = %config.store_path.display(),
            key_id = store.current_key_id().unwrap_or_default(),
            "Created key store"
        );
        Ok(store)
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    pub fn store_path(&self) -> &Path {
        &self.config.store_path
    }

    /// True once a current key exists.
    pub fn is_initialized(&self) -> bool {
        self.store.read().current().is_some()
    }

    pub fn current_key_id(&self) -> Option<String> {
        self.store.read().current_key_id().map(str::to_owned)
    }

    /// Every key id in the store, oldest first by id.
    pub fn key_ids(&self) -> Vec<String> {
        self.store.read().keys().map(|r| r.key_id.clone()).collect()
    }

    pub fn has_master_key(&self) -> bool {
        self.store.read().master_key().is_some()
    }

    // ========================================================================
    // Current key and rotation
    // ========================================================================

    /// The active key; `KeyUnavailable` when none is active or it expired.
    pub fn get_current_key(&self) -> Result<KeyRecord> {
        self.get_current_key_at(Utc::now())
    }

    pub fn get_current_key_at(&self, now: DateTime<Utc>) -> Result<KeyRecord> {
        let store = self.store.read();
        let record = store
            .current()
            .ok_or_else(|| VaultError::KeyUnavailable("no current key".into()))?;
        if !record.is_active {
            return Err(VaultError::KeyUnavailable(format!(
                "current key {} is inactive",
                record.key_id
            )));
        }
        if record.is_expired(now) {
            return Err(VaultError::KeyUnavailable(format!(
                "current key {} expired at {}",
                record.key_id, record.expires_at
            )));
        }
        Ok(record.clone())
    }

    /// Rotate when the current key is missing, inactive, or within the
    /// rotation threshold. Returns the new key id if a rotation happened.
    pub fn check_rotation(&self) -> Result<Option<String>> {
        self.check_rotation_at(Utc::now())
    }

    pub fn check_rotation_at(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let mut store = self.store.write();
        match self.rotation_reason(&store, now) {
            Some(reason) => self.rotate_locked(&mut store, now, reason).map(Some),
            None => Ok(None),
        }
    }

    fn rotation_reason(&self, store: &KeyStore, now: DateTime<Utc>) -> Option<&'static str> {
        match store.current() {
            None => Some("no current key"),
            Some(record) if !record.is_active => Some("current key inactive"),
            Some(record)
                if record.days_until_expiry(now) <= self.config.rotation_threshold_days =>
            {
                Some("current key expiring")
            }
            Some(_) => None,
        }
    }

    /// Make a freshly generated key current. Existing ciphertext is untouched.
    pub fn rotate(&self) -> Result<String> {
        self.rotate_at(Utc::now())
    }

    pub fn rotate_at(&self, now: DateTime<Utc>) -> Result<String> {
        let mut store = self.store.write();
        self.rotate_locked(&mut store, now, "scheduled")
    }

    /// Operator-requested rotation regardless of expiry.
    pub fn force_key_rotation(&self) -> Result<String> {
        let mut store = self.store.write();
        self.rotate_locked(&mut store, Utc::now(), "forced")
    }

    fn rotate_locked(
        &self,
        store: &mut KeyStore,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<String> {
        let previous = store.current_key_id().map(str::to_owned);
        let (next, key_id) = store.with_rotation(now, self.config.key_lifetime_days)?;
        next.persist(&self.config.store_path, now)?;
        *store = next;
        info!(
            key_id = %key_id,
            previous = previous.as_deref().unwrap_or("none"),
            reason,
            "Rotated encryption key"
        );
        Ok(key_id)
    }

    /// PBKDF2-HMAC-SHA256, 100,000 iterations, 32-byte output.
    pub fn derive_key_from_password(
        &self,
        password: &str,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; clinic_crypto::AES_KEY_LENGTH]>> {
        Ok(clinic_crypto::derive_key_from_password(password, salt)?)
    }

    pub fn key_info(&self) -> KeyInfo {
        self.key_info_at(Utc::now())
    }

    pub fn key_info_at(&self, now: DateTime<Utc>) -> KeyInfo {
        let store = self.store.read();
        let keys: BTreeMap<String, KeySummary> = store
            .keys()
            .map(|r| {
                (
                    r.key_id.clone(),
                    KeySummary {
                        created_at: r.created_at,
                        expires_at: r.expires_at,
                        is_active: r.is_active,
                        days_until_expiry: r.days_until_expiry(now),
                    },
                )
            })
            .collect();
        KeyInfo {
            current_key_id: store.current_key_id().map(str::to_owned),
            total_keys: keys.len(),
            active_keys: keys.values().filter(|k| k.is_active).count(),
            rotation_days: self.config.key_lifetime_days,
            keys,
        }
    }

    // ========================================================================
    // Backup and restore
    // ========================================================================

    /// Write a password-protected backup of every key.
    ///
    /// Passwords under 12 characters are rejected before any file is written.
    pub fn backup_keys(&self, path: &Path, password: &str) -> Result<()> {
        let snapshot = self.store.read().clone();
        write_backup(&snapshot, path, password, Utc::now())
    }

    /// Replace the key set with the contents of a backup.
    ///
    /// Any failure leaves the current store untouched. The master key is kept.
    /// A restored current key that is due for rotation is rotated right away.
    pub fn restore_keys(&self, path: &Path, password: &str) -> Result<()> {
        self.restore_keys_at(path, password, Utc::now())
    }

    pub fn restore_keys_at(&self, path: &Path, password: &str, now: DateTime<Utc>) -> Result<()> {
        let restored = read_backup(path, password)?;
        let mut store = self.store.write();
        let next = store.replaced_by(restored)?;
        next.persist(&self.config.store_path, now)?;
        *store = next;
        info!(
            path = %path.display(),
            keys = store.len(),
            current_key_id = store.current_key_id().unwrap_or_default(),
            "Restored keys from backup"
        );
        if let Some(reason) = self.rotation_reason(&store, now) {
            self.rotate_locked(&mut store, now, reason)?;
        }
        Ok(())
    }

    // ========================================================================
    // Collaborator-facing cipher calls
    // ========================================================================

    pub fn encrypt_field(&self, plaintext: &str) -> Result<String> {
        FieldCipher::new(self).encrypt(plaintext)
    }

    pub fn decrypt_field(&self, ciphertext: &str) -> Result<String> {
        FieldCipher::new(self).decrypt(ciphertext)
    }

    pub fn encrypt_file(&self, source: &Path) -> Result<EncryptedFile> {
        FileCipher::new(self).encrypt(source)
    }

    pub fn decrypt_file(&self, encrypted: &Path) -> Result<PathBuf> {
        FileCipher::new(self).decrypt(encrypted)
    }
}

impl KeyProvider for KeyManager {
    fn current_key(&self) -> Result<KeyRecord> {
        self.get_current_key()
    }

    fn key_by_id(&self, key_id: &str) -> Option<KeyRecord> {
        self.store.read().get(key_id).cloned()
    }

    fn fallback_key(&self) -> Option<KeyRecord> {
        self.store.read().current().cloned()
    }
}

/// Rename a corrupt store to `<name>.corrupt-<timestamp>`.
fn quarantine(path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{}", now.format("%Y%m%dT%H%M%S")));
    let aside = PathBuf::from(aside);
    std::fs::rename(path, &aside).map_err(|e| VaultError::io(path, e))?;
    Ok(aside)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::{tempdir, TempDir};

    fn jan1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn manager_at(now: DateTime<Utc>) -> (TempDir, KeyManager) {
        let dir = tempdir().unwrap();
        let config = KeyConfig::at(dir.path().join("keys.json"));
        let manager = KeyManager::open_at(config, now).unwrap();
        (dir, manager)
    }

    #[test]
    fn first_open_bootstraps_and_persists() {
        let (dir, manager) = manager_at(jan1());
        assert_eq!(manager.current_key_id().as_deref(), Some("key_20240101_000000"));
        assert!(manager.has_master_key());
        assert!(dir.path().join("keys.json").exists());
    }

    #[test]
    fn reopen_keeps_keys() {
        let (dir, manager) = manager_at(jan1());
        let id = manager.current_key_id();
        drop(manager);
        let config = KeyConfig::at(dir.path().join("keys.json"));
        let reopened = KeyManager::open_at(config, jan1() + Duration::days(1)).unwrap();
        assert_eq!(reopened.current_key_id(), id);
    }

    #[test]
    fn no_rotation_with_sixty_days_left() {
        let (_dir, manager) = manager_at(jan1());
        let now = jan1() + Duration::days(120);
        assert_eq!(manager.check_rotation_at(now).unwrap(), None);
        assert_eq!(manager.key_ids().len(), 1);
    }

    #[test]
    fn rotates_within_thirty_days() {
        let (_dir, manager) = manager_at(jan1());
        let now = jan1() + Duration::days(160);
        let new_id = manager.check_rotation_at(now).unwrap().unwrap();
        assert_eq!(manager.current_key_id(), Some(new_id));
        assert_eq!(manager.key_ids().len(), 2);
    }

    #[test]
    fn rotates_at_exactly_thirty_days() {
        let (_dir, manager) = manager_at(jan1());
        let now = jan1() + Duration::days(150);
        assert!(manager.check_rotation_at(now).unwrap().is_some());
    }

    #[test]
    fn reopening_near_expiry_rotates() {
        let (dir, manager) = manager_at(jan1());
        let first = manager.current_key_id();
        drop(manager);

        let now = jan1() + Duration::days(155);
        let config = KeyConfig::at(dir.path().join("keys.json"));
        let reopened = KeyManager::open_at(config, now).unwrap();
        assert_ne!(reopened.current_key_id(), first);
        assert_eq!(reopened.key_info_at(now).total_keys, 2);
        assert!(reopened.get_current_key_at(now).is_ok());
    }

    #[test]
    fn reopening_after_expiry_rotates() {
        let (dir, manager) = manager_at(jan1());
        let first = manager.current_key_id().unwrap();
        drop(manager);

        let now = jan1() + Duration::days(200);
        let config = KeyConfig::at(dir.path().join("keys.json"));
        let reopened = KeyManager::open_at(config, now).unwrap();
        let current = reopened.get_current_key_at(now).unwrap();
        assert_ne!(current.key_id, first);
        assert_eq!(reopened.key_info_at(now).total_keys, 2);

        // The rotation was persisted.
        drop(reopened);
        let config = KeyConfig::at(dir.path().join("keys.json"));
        let again = KeyManager::open_at(config, now).unwrap();
        assert_eq!(again.current_key_id(), Some(current.key_id));
    }

    #[test]
    fn restoring_an_expired_key_set_rotates() {
        let (dir, manager) = manager_at(jan1());
        let old = manager.current_key_id().unwrap();
        let backup = dir.path().join("keys.backup");
        manager.backup_keys(&backup, "CorrectHorseBattery9!").unwrap();

        let later = jan1() + Duration::days(200);
        let (_other_dir, other) = manager_at(later);
        other
            .restore_keys_at(&backup, "CorrectHorseBattery9!", later)
            .unwrap();

        let current = other.get_current_key_at(later).unwrap();
        assert_ne!(current.key_id, old);
        assert_eq!(other.key_ids().len(), 2);
        assert!(other.key_ids().contains(&old));
    }

    #[test]
    fn expired_current_key_is_unavailable() {
        let (_dir, manager) = manager_at(jan1());
        let err = manager
            .get_current_key_at(jan1() + Duration::days(181))
            .unwrap_err();
        assert!(matches!(err, VaultError::KeyUnavailable(_)));
    }

    #[test]
    fn rotation_retires_previous_key() {
        let (_dir, manager) = manager_at(jan1());
        let first = manager.current_key_id().unwrap();
        let second = manager.rotate_at(jan1() + Duration::hours(1)).unwrap();

        let info = manager.key_info_at(jan1());
        assert_eq!(info.total_keys, 2);
        assert_eq!(info.active_keys, 1);
        assert!(!info.keys[&first].is_active);
        assert!(info.keys[&second].is_active);
        assert_eq!(info.rotation_days, 180);
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() {
        let (dir, manager) = manager_at(jan1());
        let before = manager.key_ids();
        // Replace the store file with a directory so the atomic rename fails.
        let path = dir.path().join("keys.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        assert!(manager.rotate_at(jan1()).is_err());
        assert_eq!(manager.key_ids(), before);
    }

    #[test]
    fn corrupt_store_fails_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, b"garbage").unwrap();

        let err = KeyManager::open_at(KeyConfig::at(&path), jan1())
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");
    }

    #[test]
    fn corrupt_store_rebootstraps_when_allowed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, b"garbage").unwrap();

        let config = KeyConfig {
            corrupt_store_policy: CorruptStorePolicy::Rebootstrap,
            ..KeyConfig::at(&path)
        };
        let manager = KeyManager::open_at(config, jan1()).unwrap();
        assert!(manager.is_initialized());

        let aside = dir.path().join("keys.json.corrupt-20240101T000000");
        assert_eq!(std::fs::read(aside).unwrap(), b"garbage");
    }

    #[test]
    fn derive_key_matches_crypto_crate() {
        let (_dir, manager) = manager_at(jan1());
        let salt = [3u8; 32];
        let a = manager.derive_key_from_password("pw", &salt).unwrap();
        let b = clinic_crypto::derive_key_from_password("pw", &salt).unwrap();
        assert_eq!(*a, *b);
    }
}
