//! Scratch directory for short-lived decrypted copies.
//!
//! Decrypting for viewing never cleans up after itself; [`ScratchDir::sweep`]
//! reaps anything older than the configured max age.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::cipher::{FileCipher, ENCRYPTED_EXTENSION};
use crate::config::ScratchConfig;
use crate::error::{Result, VaultError};
use crate::fs::write_atomic;
use crate::keys::KeyProvider;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<String>,
}

pub struct ScratchDir {
    dir: PathBuf,
    max_age: Duration,
}

impl ScratchDir {
    pub fn new(config: &ScratchConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|e| VaultError::io(&config.dir, e))?;
        Ok(Self {
            dir: config.dir.clone(),
            max_age: config.max_age(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Decrypt into a uniquely named scratch file and return its path.
    pub fn decrypt_for_viewing<K: KeyProvider + ?Sized>(
        &self,
        keys: &K,
        encrypted: &Path,
    ) -> Result<PathBuf> {
        let plaintext = FileCipher::new(keys).decrypt_bytes(encrypted)?;
        self.write_view(encrypted, &plaintext)
    }

    /// Like [`ScratchDir::decrypt_for_viewing`], but nothing is written unless
    /// the plaintext matches `expected_sha256`.
    pub fn decrypt_verified_for_viewing<K: KeyProvider + ?Sized>(
        &self,
        keys: &K,
        encrypted: &Path,
        expected_sha256: &str,
    ) -> Result<PathBuf> {
        let plaintext = FileCipher::new(keys).decrypt_bytes_verified(encrypted, expected_sha256)?;
        self.write_view(encrypted, &plaintext)
    }

    /// Create `appointment_<id>_<timestamp>` under the scratch directory.
    ///
    /// The sweep removes it as a whole once it is older than the max age.
    pub fn appointment_dir(&self, appointment_id: i64) -> Result<PathBuf> {
        let dir = self.dir.join(format!(
            "appointment_{appointment_id}_{}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::create_dir_all(&dir).map_err(|e| VaultError::io(&dir, e))?;
        Ok(dir)
    }

    fn write_view(&self, encrypted: &Path, plaintext: &[u8]) -> Result<PathBuf> {
        let scratch = self.dir.join(format!(
            "temp_{}_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple(),
            original_name(encrypted)
        ));
        write_atomic(&scratch, plaintext)?;
        debug!(path = %scratch.display(), "Decrypted file for viewing");
        Ok(scratch)
    }
    /// Remove top-level entries older than the max age.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.failed.push(e.to_string());
                    continue;
                }
            };
            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                Ok(Err(e)) => {
                    report.failed.push(format!("{}: {e}", entry.path().display()));
                    continue;
                }
                Err(e) => {
                    report.failed.push(format!("{}: {e}", entry.path().display()));
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.max_age {
                continue;
            }
            let removed = if entry.file_type().is_dir() {
                std::fs::remove_dir_all(entry.path())
            } else {
                std::fs::remove_file(entry.path())
            };
            match removed {
                Ok(()) => report.removed.push(entry.path().to_path_buf()),
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "Could not remove scratch entry"
                    );
                    report.failed.push(format!("{}: {e}", entry.path().display()));
                }
            }
        }
        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), "Swept scratch directory");
        }
        report
    }
}

/// File name of the plaintext an encrypted file came from.
pub(crate) fn original_name(encrypted: &Path) -> String {
    let original = if encrypted.extension().is_some_and(|ext| ext == ENCRYPTED_EXTENSION) {
        encrypted.with_extension("")
    } else {
        encrypted.to_path_buf()
    };
    original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::test_keys::StaticKeys;
    use clinic_crypto::sha256_hex;
    use tempfile::tempdir;

    fn scratch_in(dir: &Path) -> ScratchDir {
        ScratchDir::new(&ScratchConfig {
            dir: dir.join("scratch"),
            max_age_secs: 3600,
        })
        .unwrap()
    }

    #[test]
    fn decrypt_for_viewing_uses_unique_names() {
        let dir = tempdir().unwrap();
        let keys = StaticKeys::with_ids(&["k1"]);
        let source = dir.path().join("visit.wav");
        std::fs::write(&source, b"audio").unwrap();
        let encrypted = FileCipher::new(&keys).encrypt(&source).unwrap();

        let scratch = scratch_in(dir.path());
        let a = scratch.decrypt_for_viewing(&keys, &encrypted.path).unwrap();
        let b = scratch.decrypt_for_viewing(&keys, &encrypted.path).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(scratch.path()));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("temp_"));
        assert!(name.ends_with("_visit.wav"));
        assert_eq!(std::fs::read(&a).unwrap(), b"audio");
    }

    #[test]
    fn verified_view_refuses_wrong_hash() {
        let dir = tempdir().unwrap();
        let keys = StaticKeys::with_ids(&["k1"]);
        let source = dir.path().join("intake.pdf");
        std::fs::write(&source, b"%PDF-1.7").unwrap();
        let encrypted = FileCipher::new(&keys).encrypt(&source).unwrap();
        let scratch = scratch_in(dir.path());

        let err = scratch
            .decrypt_verified_for_viewing(&keys, &encrypted.path, &sha256_hex(b"other"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        let view = scratch
            .decrypt_verified_for_viewing(&keys, &encrypted.path, &encrypted.plaintext_sha256)
            .unwrap();
        assert_eq!(std::fs::read(view).unwrap(), b"%PDF-1.7");
    }

    #[test]
    fn appointment_dirs_are_swept_whole() {
        let dir = tempdir().unwrap();
        let scratch = scratch_in(dir.path());
        let appointment = scratch.appointment_dir(42).unwrap();
        assert!(appointment
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("appointment_42_"));
        std::fs::write(appointment.join("visit.wav"), b"audio").unwrap();

        let report = scratch.sweep_at(SystemTime::now() + Duration::from_secs(2 * 3600));
        assert_eq!(report.removed, vec![appointment.clone()]);
        assert!(!appointment.exists());
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let dir = tempdir().unwrap();
        let scratch = scratch_in(dir.path());
        std::fs::write(scratch.path().join("temp_a"), b"x").unwrap();

        let report = scratch.sweep();
        assert!(report.removed.is_empty());
        assert!(scratch.path().join("temp_a").exists());
    }

    #[test]
    fn sweep_removes_entries_past_max_age() {
        let dir = tempdir().unwrap();
        let scratch = scratch_in(dir.path());
        std::fs::write(scratch.path().join("temp_a"), b"x").unwrap();
        std::fs::create_dir(scratch.path().join("temp_dir")).unwrap();
        std::fs::write(scratch.path().join("temp_dir").join("inner"), b"y").unwrap();

        let later = SystemTime::now() + Duration::from_secs(2 * 3600);
        let report = scratch.sweep_at(later);
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
