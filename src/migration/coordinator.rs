//! Drives a plaintext clinic database and data directory to encrypted form.
//!
//! Steps: snapshot, records, files, verification. Only the snapshot is
//! all-or-nothing; record and file steps work item by item, collect failures
//! into their report and can simply be run again.
//!
//! The same file path serves day-to-day use through
//! [`MigrationCoordinator::encrypt_appointment_files`] and
//! [`MigrationCoordinator::decrypt_appointment_files`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::report::{
    AppointmentDecryptReport, DecryptedFile, FileMigrationReport, FullMigrationReport,
    ItemDetail, MigrationStatus, RecordMigrationReport, SnapshotInfo, VerificationReport,
};
use super::snapshot::{create_snapshot, snapshot_dir_name};
use super::state::MigrationState;
use super::store::{
    AppointmentRow, EncryptedAppointment, EncryptedFileColumns, FileRow, RecordStore,
};
use crate::cipher::{default_decrypted_path, FieldCipher, FileCipher};
use crate::config::MigrationConfig;
use crate::error::{MigrationItemError, Result, VaultError};
use crate::keys::KeyManager;
use crate::policy::requires_encryption;
use crate::scratch::{original_name, ScratchDir};

pub struct MigrationCoordinator {
    keys: Arc<KeyManager>,
    store: Arc<dyn RecordStore>,
    config: MigrationConfig,
    state: Mutex<MigrationState>,
    snapshot: Mutex<Option<SnapshotInfo>>,
    cancel: CancelToken,
}

impl MigrationCoordinator {
    pub fn new(
        keys: Arc<KeyManager>,
        store: Arc<dyn RecordStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            keys,
            store,
            config,
            state: Mutex::new(MigrationState::NotStarted),
            snapshot: Mutex::new(None),
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> MigrationState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> Option<SnapshotInfo> {
        self.snapshot.lock().clone()
    }

    /// Token that stops `migrate_files` before its next batch.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn advance(&self, step: MigrationState) {
        let mut state = self.state.lock();
        *state = state.after(step);
    }

    fn fail(&self, step: &str, reason: &dyn std::fmt::Display) {
        error!(step, reason = %reason, "Migration step failed");
        *self.state.lock() = MigrationState::Failed;
    }

    fn require_snapshot(&self) -> Result<()> {
        if self.snapshot.lock().is_none() {
            return Err(VaultError::Migration(
                "no pre-migration snapshot has been taken".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Status and snapshot
    // ========================================================================

    pub fn check_status(&self) -> Result<MigrationStatus> {
        Ok(MigrationStatus {
            initialized: self.keys.is_initialized(),
            current_key_id: self.keys.current_key_id(),
            appointments: self.store.appointment_counts()?,
            files: self.store.file_counts()?,
            state: self.state(),
            snapshot: self.snapshot.lock().as_ref().map(|s| s.path.clone()),
            timestamp: Utc::now(),
        })
    }

    /// Snapshot the database and data directory under the snapshot root.
    ///
    /// Required before any step that rewrites data.
    pub fn create_backup(&self) -> Result<SnapshotInfo> {
        let now = Utc::now();
        let root = &self.config.snapshot_root;
        let base = snapshot_dir_name(now);
        let mut destination = root.join(&base);
        let mut n = 2;
        while destination.exists() {
            destination = root.join(format!("{base}_{n}"));
            n += 1;
        }

        match create_snapshot(
            self.store.as_ref(),
            &self.config.data_dir,
            &destination,
            &[root.as_path()],
            now,
        ) {
            Ok(info) => {
                *self.snapshot.lock() = Some(info.clone());
                self.advance(MigrationState::BackupCreated);
                Ok(info)
            }
            Err(e) => {
                self.fail("backup", &e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Encrypt every unencrypted appointment and clear its plaintext columns.
    pub fn migrate_records(&self) -> Result<RecordMigrationReport> {
        self.require_snapshot()?;
        let rows = self
            .store
            .unencrypted_appointments()
            .inspect_err(|e| self.fail("records", e))?;
        info!(count = rows.len(), "Migrating appointment records");

        let mut report = RecordMigrationReport {
            total: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            let item = format!("appointment {}", row.appointment_id);
            match self.migrate_record(row) {
                Ok(key_id) => {
                    debug!(
                        appointment_id = row.appointment_id,
                        key_id = %key_id,
                        "Encrypted record"
                    );
                    report.push_migrated(item);
                }
                Err(e) => {
                    error!(
                        appointment_id = row.appointment_id,
                        error = %e,
                        "Record migration failed"
                    );
                    report.push_failed(MigrationItemError::new(item, e));
                }
            }
        }

        let report = report.finish();
        if report.success {
            self.advance(MigrationState::RecordsMigrated);
        } else {
            self.fail("records", &report.message);
        }
        info!(
            migrated = report.migrated,
            failed = report.failed,
            "Record migration finished"
        );
        Ok(report)
    }

    /// Every field of one record is sealed under the same key.
    fn migrate_record(&self, row: &AppointmentRow) -> Result<String> {
        let key = self.keys.get_current_key()?;
        let cipher = FieldCipher::new(self.keys.as_ref());
        let seal = |value: &Option<String>| {
            cipher.encrypt_with_key(value.as_deref().unwrap_or_default(), &key.key_id)
        };
        let columns = EncryptedAppointment {
            patient_name: seal(&row.patient_name)?,
            notes: seal(&row.notes)?,
            folder_path: seal(&row.folder_path)?,
            key_id: key.key_id.clone(),
        };
        self.store
            .mark_appointment_encrypted(row.appointment_id, &columns)?;
        Ok(columns.key_id)
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Encrypt every non-deleted file in batches of `batch_size`.
    ///
    /// The cancel token is checked between batches.
    pub fn migrate_files(&self, batch_size: usize) -> Result<FileMigrationReport> {
        self.require_snapshot()?;
        let rows = self.store.active_files().inspect_err(|e| self.fail("files", e))?;
        let batch_size = batch_size.max(1);
        info!(count = rows.len(), batch_size, "Migrating files");

        let mut report = FileMigrationReport {
            total: rows.len(),
            ..Default::default()
        };
        for (index, batch) in rows.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!(completed_batches = index, "File migration cancelled");
                report.cancelled = true;
                break;
            }
            for row in batch {
                match self.migrate_file(row) {
                    Ok(detail) => report.push(detail),
                    Err(e) => report.push_failed(e),
                }
            }
            report.batches += 1;
            info!(
                batch = index + 1,
                migrated = report.migrated,
                skipped = report.skipped,
                failed = report.failed,
                "File batch complete"
            );
        }

        let report = report.finish();
        if !report.success {
            self.fail("files", &report.message);
        } else if !report.cancelled {
            self.advance(MigrationState::FilesMigrated);
        }
        Ok(report)
    }

    /// Encrypt at most `limit` files that still need it.
    pub fn encrypt_pending_files(&self, limit: usize) -> Result<FileMigrationReport> {
        self.require_snapshot()?;
        let pending: Vec<FileRow> = self
            .store
            .active_files()?
            .into_iter()
            .filter(|row| {
                !row.is_encrypted
                    && row
                        .file_path
                        .as_deref()
                        .is_some_and(|p| !p.is_empty() && requires_encryption(Path::new(p)))
            })
            .take(limit)
            .collect();

        let mut report = FileMigrationReport {
            total: pending.len(),
            batches: 1,
            ..Default::default()
        };
        for row in &pending {
            match self.migrate_file(row) {
                Ok(detail) => report.push(detail),
                Err(e) => report.push_failed(e),
            }
        }
        let report = report.finish();
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "Encrypted pending files"
        );
        Ok(report)
    }

    /// Encrypt one file, record it, then remove the plaintext original.
    fn migrate_file(&self, row: &FileRow) -> std::result::Result<ItemDetail, MigrationItemError> {
        let item = format!("file {}", row.file_id);
        if row.is_encrypted {
            return Ok(ItemDetail::skipped(item, "already encrypted"));
        }
        if !row.owner_exists {
            warn!(
                file_id = row.file_id,
                appointment_id = row.appointment_id,
                "No owning appointment"
            );
            return Ok(ItemDetail::skipped(item, "no owning appointment"));
        }
        let Some(source) = row.file_path.as_deref().filter(|p| !p.is_empty()).map(PathBuf::from)
        else {
            warn!(file_id = row.file_id, "File row has no path");
            return Ok(ItemDetail::skipped(item, "no file path"));
        };
        if !requires_encryption(&source) {
            return Ok(ItemDetail::skipped(item, "not required"));
        }
        if !source.exists() {
            warn!(file_id = row.file_id, path = %source.display(), "File not found");
            return Ok(ItemDetail::skipped(item, "file not found"));
        }

        let fail = |reason: String| {
            error!(file_id = row.file_id, error = %reason, "File migration failed");
            MigrationItemError::new(item.clone(), reason)
        };

        let encrypted = FileCipher::new(self.keys.as_ref())
            .encrypt(&source)
            .map_err(|e| fail(e.to_string()))?;
        let discard_output = || {
            if let Err(e) = std::fs::remove_file(&encrypted.path) {
                warn!(
                    path = %encrypted.path.display(),
                    error = %e,
                    "Could not remove encrypted copy"
                );
            }
        };

        let cipher = FieldCipher::new(self.keys.as_ref());
        let columns = cipher
            .encrypt_with_key(&encrypted.path.to_string_lossy(), &encrypted.key_id)
            .and_then(|file_path| {
                Ok(EncryptedFileColumns {
                    file_path,
                    file_hash: cipher
                        .encrypt_with_key(&encrypted.plaintext_sha256, &encrypted.key_id)?,
                    key_id: encrypted.key_id.clone(),
                })
            });
        let recorded = columns.and_then(|c| self.store.mark_file_encrypted(row.file_id, &c));
        if let Err(e) = recorded {
            discard_output();
            return Err(fail(e.to_string()));
        }

        if let Err(e) = std::fs::remove_file(&source) {
            return Err(fail(format!(
                "encrypted, but the plaintext original could not be removed: {e}"
            )));
        }
        debug!(file_id = row.file_id, key_id = %encrypted.key_id, "Encrypted file");
        Ok(ItemDetail::migrated(item))
    }

    // ========================================================================
    // Per-appointment files
    // ========================================================================

    /// Encrypt the files of one appointment, e.g. right after a session was
    /// saved. Does not require a snapshot.
    pub fn encrypt_appointment_files(&self, appointment_id: i64) -> Result<FileMigrationReport> {
        let rows = self.store.appointment_files(appointment_id)?;
        let mut report = FileMigrationReport {
            total: rows.len(),
            batches: 1,
            ..Default::default()
        };
        for row in &rows {
            match self.migrate_file(row) {
                Ok(detail) => report.push(detail),
                Err(e) => report.push_failed(e),
            }
        }
        let report = report.finish();
        info!(
            appointment_id,
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "Encrypted appointment files"
        );
        Ok(report)
    }

    /// Decrypt every encrypted file of one appointment, checking each against
    /// its stored content hash.
    ///
    /// With `scratch`, output goes to a fresh `appointment_<id>_<timestamp>`
    /// subdirectory of it; otherwise next to each `.enc` file.
    pub fn decrypt_appointment_files(
        &self,
        appointment_id: i64,
        scratch: Option<&ScratchDir>,
    ) -> Result<AppointmentDecryptReport> {
        let rows: Vec<FileRow> = self
            .store
            .appointment_files(appointment_id)?
            .into_iter()
            .filter(|row| row.is_encrypted)
            .collect();
        let directory = scratch
            .map(|s| s.appointment_dir(appointment_id))
            .transpose()?;

        let mut report = AppointmentDecryptReport {
            appointment_id,
            total: rows.len(),
            directory: directory.clone(),
            ..Default::default()
        };
        let files = FileCipher::new(self.keys.as_ref());
        for row in &rows {
            let decrypted = self.encrypted_location(row).and_then(|(encrypted, expected)| {
                let destination = match &directory {
                    Some(dir) => dir.join(original_name(&encrypted)),
                    None => default_decrypted_path(&encrypted),
                };
                files.decrypt_verified_to(&encrypted, &expected, &destination)?;
                Ok(DecryptedFile {
                    file_id: row.file_id,
                    encrypted_path: encrypted,
                    decrypted_path: destination,
                })
            });
            match decrypted {
                Ok(file) => report.push(file),
                Err(e) => {
                    warn!(file_id = row.file_id, error = %e, "File decryption failed");
                    let item = format!("file {}", row.file_id);
                    report.push_failed(MigrationItemError::new(item, e));
                }
            }
        }

        let report = report.finish();
        info!(
            appointment_id,
            decrypted = report.decrypted,
            failed = report.failed,
            "Decrypted appointment files"
        );
        Ok(report)
    }

    /// The `.enc` path and plaintext SHA-256 recorded for an encrypted file.
    fn encrypted_location(&self, row: &FileRow) -> Result<(PathBuf, String)> {
        let cipher = FieldCipher::new(self.keys.as_ref());
        let path = cipher.decrypt(row.file_path_encrypted.as_deref().unwrap_or_default())?;
        if path.is_empty() {
            return Err(VaultError::Decryption("no encrypted path recorded".into()));
        }
        let hash = cipher.decrypt(row.file_hash_encrypted.as_deref().unwrap_or_default())?;
        if hash.is_empty() {
            return Err(VaultError::Decryption("no content hash recorded".into()));
        }
        Ok((PathBuf::from(path), hash))
    }

    /// Run [`MigrationCoordinator::migrate_files`] on the blocking pool.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn_file_migration(
        self: &Arc<Self>,
        batch_size: usize,
    ) -> JoinHandle<Result<FileMigrationReport>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.migrate_files(batch_size))
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Check that migrated data decrypts, that every encrypted file still
    /// matches its stored content hash, and that no plaintext is left behind.
    ///
    /// Reports mismatches; never rolls anything back.
    pub fn verify(&self) -> Result<VerificationReport> {
        let mut mismatches = Vec::new();
        let cipher = FieldCipher::new(self.keys.as_ref());
        let files = FileCipher::new(self.keys.as_ref());

        for row in self.store.appointments()? {
            let item = format!("appointment {}", row.appointment_id);
            if !row.is_encrypted {
                mismatches.push(MigrationItemError::new(item, "not encrypted"));
                continue;
            }
            let plaintext_left = [&row.patient_name, &row.notes, &row.folder_path]
                .into_iter()
                .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
            if plaintext_left {
                mismatches.push(MigrationItemError::new(item.clone(), "plaintext still stored"));
            }
            for value in [
                &row.patient_name_encrypted,
                &row.notes_encrypted,
                &row.folder_path_encrypted,
            ] {
                if let Err(e) = cipher.decrypt(value.as_deref().unwrap_or_default()) {
                    mismatches.push(MigrationItemError::new(item.clone(), e));
                    break;
                }
            }
        }

        for row in self.store.active_files()? {
            let item = format!("file {}", row.file_id);
            if !row.is_encrypted {
                let pending = row.owner_exists
                    && row.file_path.as_deref().is_some_and(|p| {
                        let p = Path::new(p);
                        requires_encryption(p) && p.exists()
                    });
                if pending {
                    mismatches.push(MigrationItemError::new(item, "not encrypted"));
                }
                continue;
            }
            if row.file_path.as_deref().is_some_and(|p| !p.is_empty()) {
                mismatches.push(MigrationItemError::new(
                    item.clone(),
                    "plaintext path still stored",
                ));
            }
            let (encrypted, expected) = match self.encrypted_location(&row) {
                Ok(location) => location,
                Err(e) => {
                    mismatches.push(MigrationItemError::new(item, e));
                    continue;
                }
            };
            if !encrypted.exists() {
                mismatches.push(MigrationItemError::new(
                    item.clone(),
                    "encrypted file missing",
                ));
            } else if let Err(e) = files.decrypt_bytes_verified(&encrypted, &expected) {
                mismatches.push(MigrationItemError::new(item.clone(), e));
            }
            if default_decrypted_path(&encrypted).exists() {
                mismatches.push(MigrationItemError::new(
                    item,
                    "plaintext original still on disk",
                ));
            }
        }

        let success = mismatches.is_empty();
        if success && self.state() == MigrationState::FilesMigrated {
            self.advance(MigrationState::Verified);
        }
        for mismatch in &mismatches {
            warn!(item = %mismatch.item, reason = %mismatch.reason, "Verification mismatch");
        }
        let report = VerificationReport {
            success,
            appointments: self.store.appointment_counts()?,
            files: self.store.file_counts()?,
            message: if success {
                "All migrated data verified".to_string()
            } else {
                format!("{} verification mismatches", mismatches.len())
            },
            mismatches,
        };
        info!(success, "Verification finished");
        Ok(report)
    }

    // ========================================================================
    // Full run
    // ========================================================================

    /// Snapshot, records, files and verification, stopping at the first
    /// step that reports failures.
    pub fn run_full(&self) -> Result<FullMigrationReport> {
        info!("Starting full migration");
        let mut full = FullMigrationReport {
            success: false,
            state: self.state(),
            snapshot: Some(self.create_backup()?),
            records: None,
            files: None,
            verification: None,
            message: String::new(),
        };

        let records = self.migrate_records()?;
        let records_ok = records.success;
        full.records = Some(records);
        if !records_ok {
            return Ok(self.stopped(full, "record migration reported failures"));
        }

        let files = self.migrate_files(self.config.batch_size)?;
        let files_ok = files.success && !files.cancelled;
        full.files = Some(files);
        if !files_ok {
            return Ok(self.stopped(full, "file migration did not complete"));
        }

        let verification = self.verify()?;
        let verified = verification.success;
        full.verification = Some(verification);
        if !verified {
            self.fail("verify", &"mismatches found");
            return Ok(self.stopped(full, "verification found mismatches"));
        }

        self.advance(MigrationState::Done);
        full.success = true;
        full.state = self.state();
        full.message = "Migration completed".to_string();
        info!("Full migration completed");
        Ok(full)
    }

    fn stopped(&self, mut full: FullMigrationReport, reason: &str) -> FullMigrationReport {
        *self.state.lock() = MigrationState::Failed;
        full.state = MigrationState::Failed;
        full.message = format!("Migration stopped: {reason}");
        warn!(reason, "Full migration stopped");
        full
    }
}
