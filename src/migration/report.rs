use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::MigrationState;
use super::store::EncryptionCounts;
use crate::error::MigrationItemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Migrated,
    Skipped,
    Failed,
}

/// Outcome for one record or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemDetail {
    pub item: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ItemDetail {
    pub(crate) fn migrated(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: ItemStatus::Migrated,
            reason: None,
        }
    }

    pub(crate) fn skipped(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: ItemStatus::Skipped,
            reason: Some(reason.into()),
        }
    }

    pub(crate) fn failed(error: &MigrationItemError) -> Self {
        Self {
            item: error.item.clone(),
            status: ItemStatus::Failed,
            reason: Some(error.reason.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub initialized: bool,
    pub current_key_id: Option<String>,
    pub appointments: EncryptionCounts,
    pub files: EncryptionCounts,
    pub state: MigrationState,
    pub snapshot: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl MigrationStatus {
    /// Nothing left to encrypt. Exempt files do not count.
    pub fn is_complete(&self) -> bool {
        self.appointments.unencrypted == 0 && self.files.unencrypted == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub database_backup: Option<PathBuf>,
    pub data_backup: PathBuf,
    pub files_copied: usize,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordMigrationReport {
    pub success: bool,
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
    pub details: Vec<ItemDetail>,
    pub errors: Vec<MigrationItemError>,
    pub message: String,
}

impl RecordMigrationReport {
    pub(crate) fn push_migrated(&mut self, item: String) {
        self.migrated += 1;
        self.details.push(ItemDetail::migrated(item));
    }

    pub(crate) fn push_failed(&mut self, error: MigrationItemError) {
        self.failed += 1;
        self.details.push(ItemDetail::failed(&error));
        self.errors.push(error);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.success = self.failed == 0;
        self.message = format!(
            "Migrated {} of {} records ({} failed)",
            self.migrated, self.total, self.failed
        );
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileMigrationReport {
    pub success: bool,
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    pub cancelled: bool,
    pub details: Vec<ItemDetail>,
    pub errors: Vec<MigrationItemError>,
    pub message: String,
}

impl FileMigrationReport {
    pub(crate) fn push(&mut self, detail: ItemDetail) {
        match detail.status {
            ItemStatus::Migrated => self.migrated += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
        self.details.push(detail);
    }

    pub(crate) fn push_failed(&mut self, error: MigrationItemError) {
        self.push(ItemDetail::failed(&error));
        self.errors.push(error);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.success = self.failed == 0;
        self.message = format!(
            "Encrypted {} of {} files ({} skipped, {} failed){}",
            self.migrated,
            self.total,
            self.skipped,
            self.failed,
            if self.cancelled { ", cancelled" } else { "" }
        );
        self
    }
}

/// One file decrypted for an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedFile {
    pub file_id: i64,
    pub encrypted_path: PathBuf,
    pub decrypted_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppointmentDecryptReport {
    pub success: bool,
    pub appointment_id: i64,
    pub total: usize,
    pub decrypted: usize,
    pub failed: usize,
    /// Scratch subdirectory holding the plaintext, when one was used.
    pub directory: Option<PathBuf>,
    pub files: Vec<DecryptedFile>,
    pub errors: Vec<MigrationItemError>,
    pub message: String,
}

impl AppointmentDecryptReport {
    pub(crate) fn push(&mut self, file: DecryptedFile) {
        self.decrypted += 1;
        self.files.push(file);
    }

    pub(crate) fn push_failed(&mut self, error: MigrationItemError) {
        self.failed += 1;
        self.errors.push(error);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.success = self.failed == 0;
        self.message = format!(
            "Decrypted {} of {} files ({} failed)",
            self.decrypted, self.total, self.failed
        );
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub success: bool,
    pub appointments: EncryptionCounts,
    pub files: EncryptionCounts,
    pub mismatches: Vec<MigrationItemError>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullMigrationReport {
    pub success: bool,
    pub state: MigrationState,
    pub snapshot: Option<SnapshotInfo>,
    pub records: Option<RecordMigrationReport>,
    pub files: Option<FileMigrationReport>,
    pub verification: Option<VerificationReport>,
    pub message: String,
}
