//! Integration tests for `MigrationCoordinator` against a SQLite clinic
//! database on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clinic_vault::migration::{ItemStatus, NewAppointment, NewFile, RecordStore};
use clinic_vault::{
    KeyConfig, KeyManager, MigrationConfig, MigrationCoordinator, MigrationState, ScratchConfig,
    ScratchDir, SqliteRecordStore, VaultError,
};
use tempfile::{tempdir, TempDir};

// ============================================================================
// Helpers
// ============================================================================

struct Clinic {
    dir: TempDir,
    keys: Arc<KeyManager>,
    store: Arc<SqliteRecordStore>,
    config: MigrationConfig,
}

impl Clinic {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).expect("data dir");
        let keys = Arc::new(
            KeyManager::open(KeyConfig::at(dir.path().join("keys.json"))).expect("key manager"),
        );
        let database_path = data.join("clinic.db");
        let store = Arc::new(SqliteRecordStore::open(&database_path).expect("open database"));
        let config = MigrationConfig {
            database_path,
            data_dir: data,
            snapshot_root: dir.path().join("migration_backups"),
            batch_size: 2,
        };
        Self {
            dir,
            keys,
            store,
            config,
        }
    }

    fn coordinator(&self) -> MigrationCoordinator {
        MigrationCoordinator::new(self.keys.clone(), self.store.clone(), self.config.clone())
    }

    fn scratch(&self) -> ScratchDir {
        ScratchDir::new(&ScratchConfig {
            dir: self.dir.path().join("scratch"),
            max_age_secs: 3600,
        })
        .expect("scratch dir")
    }

    fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn appointment(&self, code: &str, patient: &str) -> i64 {
        let folder = self.data().join(code);
        std::fs::create_dir_all(&folder).expect("appointment folder");
        self.store
            .insert_appointment(&NewAppointment {
                appointment_code: code,
                patient_name: patient,
                appointment_date: "2024-01-15",
                appointment_time: "09:30",
                notes: Some("reports headaches"),
                folder_path: folder.to_str().expect("utf-8 path"),
            })
            .expect("insert appointment")
    }

    /// Write `contents` under the appointment folder and register it.
    fn file(&self, appointment_id: i64, code: &str, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.data().join(code).join(name);
        std::fs::write(&path, contents).expect("write file");
        self.store
            .insert_file(&NewFile {
                appointment_id,
                file_type: "audio",
                file_path: path.to_str().expect("utf-8 path"),
                retention_policy: "standard",
                retention_date: "2031-01-15",
            })
            .expect("insert file");
        path
    }
}

/// Flip one bit of `path` at `offset`.
fn flip_byte(path: &Path, offset: usize) {
    let mut data = std::fs::read(path).expect("read");
    data[offset] ^= 0x01;
    std::fs::write(path, data).expect("write");
}

fn entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// Snapshot gate
// ============================================================================

#[test]
fn migration_refuses_to_run_without_snapshot() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    let audio = clinic.file(id, "A-001", "visit.wav", b"audio");
    let coordinator = clinic.coordinator();

    assert!(matches!(
        coordinator.migrate_records(),
        Err(VaultError::Migration(_))
    ));
    assert!(matches!(
        coordinator.migrate_files(10),
        Err(VaultError::Migration(_))
    ));
    assert!(audio.exists());
    assert_eq!(clinic.store.appointment_counts().expect("counts").encrypted, 0);
}

#[test]
fn failed_snapshot_leaves_no_partial_directory() {
    let mut clinic = Clinic::new();
    clinic.config.data_dir = clinic.dir.path().join("missing");
    let coordinator = clinic.coordinator();

    assert!(coordinator.create_backup().is_err());
    assert_eq!(coordinator.state(), MigrationState::Failed);
    assert!(entries(&clinic.config.snapshot_root).is_empty());
    assert!(matches!(
        coordinator.migrate_records(),
        Err(VaultError::Migration(_))
    ));
}

#[test]
fn snapshot_holds_plaintext_copies() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    clinic.file(id, "A-001", "visit.wav", b"audio");
    let coordinator = clinic.coordinator();

    let snapshot = coordinator.create_backup().expect("snapshot");
    assert_eq!(coordinator.state(), MigrationState::BackupCreated);
    assert!(snapshot.path.join("clinic_data_backup.db").exists());
    assert!(snapshot.path.join("backup_metadata.json").exists());
    assert_eq!(
        std::fs::read(snapshot.data_backup.join("A-001").join("visit.wav")).expect("copy"),
        b"audio"
    );

    let copy = SqliteRecordStore::open(&snapshot.path.join("clinic_data_backup.db"))
        .expect("open copy");
    let rows = copy.appointments().expect("rows");
    assert_eq!(rows[0].patient_name.as_deref(), Some("John Doe"));
}

// ============================================================================
// Records and files
// ============================================================================

#[test]
fn records_and_files_are_encrypted_and_plaintext_removed() {
    let clinic = Clinic::new();
    let first = clinic.appointment("A-001", "John Doe");
    let second = clinic.appointment("A-002", "Jane Roe");
    let audio = clinic.file(first, "A-001", "visit.wav", b"RIFF audio");
    let transcript = clinic.file(second, "A-002", "transcript.txt", b"Patient reports...");
    let coordinator = clinic.coordinator();
    coordinator.create_backup().expect("snapshot");

    let records = coordinator.migrate_records().expect("records");
    assert!(records.success);
    assert_eq!(records.migrated, 2);

    for row in clinic.store.appointments().expect("rows") {
        assert!(row.is_encrypted);
        assert_eq!(row.patient_name.as_deref(), Some(""));
        assert_eq!(row.notes, None);
        assert_eq!(row.folder_path.as_deref(), Some(""));
    }
    let row = clinic.store.appointment(first).expect("query").expect("row");
    let name = clinic
        .keys
        .decrypt_field(row.patient_name_encrypted.as_deref().expect("ciphertext"))
        .expect("decrypt");
    assert_eq!(name, "John Doe");

    let files = coordinator.migrate_files(1).expect("files");
    assert!(files.success, "{files:?}");
    assert_eq!(files.migrated, 2);
    assert_eq!(files.batches, 2);
    assert!(!audio.exists());
    assert!(!transcript.exists());

    let encrypted = clinic.data().join("A-001").join("visit.wav.enc");
    let decrypted = clinic.keys.decrypt_file(&encrypted).expect("decrypt file");
    assert_eq!(std::fs::read(decrypted).expect("read"), b"RIFF audio");

    let verification = coordinator.verify().expect("verify");
    assert!(verification.success, "{:?}", verification.mismatches);
    assert_eq!(verification.files.unencrypted, 0);
    assert_eq!(coordinator.state(), MigrationState::Verified);
}

#[test]
fn second_file_run_skips_everything() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    clinic.file(id, "A-001", "visit.wav", b"audio");
    clinic.file(id, "A-001", "intake.pdf", b"%PDF");
    let coordinator = clinic.coordinator();
    coordinator.create_backup().expect("snapshot");

    let first = coordinator.migrate_files(10).expect("first run");
    assert_eq!(first.migrated, 2);

    let second = coordinator.migrate_files(10).expect("second run");
    assert!(second.success);
    assert_eq!(second.migrated, 0);
    assert_eq!(second.skipped, 2);
    assert!(second
        .details
        .iter()
        .all(|d| d.status == ItemStatus::Skipped
            && d.reason.as_deref() == Some("already encrypted")));
}

#[test]
fn missing_files_are_skipped_not_failed() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    let audio = clinic.file(id, "A-001", "visit.wav", b"audio");
    std::fs::remove_file(&audio).expect("remove");
    let coordinator = clinic.coordinator();
    coordinator.create_backup().expect("snapshot");

    let report = coordinator.migrate_files(10).expect("files");
    assert!(report.success);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.details[0].reason.as_deref(), Some("file not found"));
}

#[test]
fn verify_flags_plaintext_left_behind() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    clinic.file(id, "A-001", "visit.wav", b"audio");
    let coordinator = clinic.coordinator();

    let report = coordinator.verify().expect("verify");
    assert!(!report.success);
    assert_eq!(report.mismatches.len(), 2);
    assert_eq!(coordinator.state(), MigrationState::NotStarted);
}

// ============================================================================
// Full run and background migration
// ============================================================================

#[test]
fn full_run_finishes_in_done_state() {
    let clinic = Clinic::new();
    let mut ids = Vec::new();
    for (code, patient) in [("A-001", "John Doe"), ("A-002", "Jane Roe")] {
        let id = clinic.appointment(code, patient);
        clinic.file(id, code, "visit.wav", patient.as_bytes());
        ids.push(id);
    }
    let photo = clinic.file(ids[0], "A-001", "photo.png", b"png");
    let coordinator = clinic.coordinator();

    let report = coordinator.run_full().expect("full run");
    assert!(report.success, "{}", report.message);
    assert_eq!(report.state, MigrationState::Done);
    assert_eq!(coordinator.state(), MigrationState::Done);
    assert!(photo.exists());

    let status = coordinator.check_status().expect("status");
    assert!(status.is_complete(), "{:?}", status.files);
    assert!(status.initialized);
    assert_eq!(status.appointments.encrypted, 2);
    assert_eq!(status.files.encrypted, 2);
    assert_eq!(status.files.exempt, 1);
}

// ============================================================================
// Content integrity
// ============================================================================

#[test]
fn damaged_encrypted_file_is_caught_by_verify_and_decrypt() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    clinic.file(id, "A-001", "visit.wav", &[0x52; 64]);
    let coordinator = clinic.coordinator();
    assert!(coordinator.run_full().expect("full run").success);

    let encrypted = clinic.data().join("A-001").join("visit.wav.enc");
    flip_byte(&encrypted, 20);

    let verification = coordinator.verify().expect("verify");
    assert!(!verification.success);
    assert_eq!(verification.mismatches.len(), 1);
    assert!(
        verification.mismatches[0].reason.contains("hash mismatch"),
        "{:?}",
        verification.mismatches
    );

    let scratch = clinic.scratch();
    let report = coordinator
        .decrypt_appointment_files(id, Some(&scratch))
        .expect("decrypt");
    assert!(!report.success);
    assert_eq!(report.failed, 1);
    assert_eq!(report.decrypted, 0);
    let directory = report.directory.expect("appointment dir");
    assert!(entries(&directory).is_empty());
}

// ============================================================================
// Per-appointment files
// ============================================================================

#[test]
fn appointment_files_are_encrypted_one_appointment_at_a_time() {
    let clinic = Clinic::new();
    let first = clinic.appointment("A-001", "John Doe");
    let second = clinic.appointment("A-002", "Jane Roe");
    let audio = clinic.file(first, "A-001", "visit.wav", b"audio");
    let notes = clinic.file(first, "A-001", "notes.txt", b"notes");
    let other = clinic.file(second, "A-002", "visit.wav", b"other audio");
    let coordinator = clinic.coordinator();

    let report = coordinator.encrypt_appointment_files(first).expect("encrypt");
    assert!(report.success, "{report:?}");
    assert_eq!((report.total, report.migrated, report.skipped), (2, 2, 0));
    assert!(!audio.exists());
    assert!(!notes.exists());
    assert!(other.exists());

    let again = coordinator.encrypt_appointment_files(first).expect("encrypt again");
    assert_eq!((again.migrated, again.skipped), (0, 2));
}

#[test]
fn appointment_files_decrypt_into_scratch_or_in_place() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    let audio = clinic.file(id, "A-001", "visit.wav", b"RIFF audio");
    clinic.file(id, "A-001", "photo.png", b"png");
    let coordinator = clinic.coordinator();
    coordinator.encrypt_appointment_files(id).expect("encrypt");

    let scratch = clinic.scratch();
    let report = coordinator
        .decrypt_appointment_files(id, Some(&scratch))
        .expect("decrypt");
    assert!(report.success, "{report:?}");
    assert_eq!((report.total, report.decrypted), (1, 1));
    let directory = report.directory.expect("appointment dir");
    assert!(directory.starts_with(scratch.path()));
    assert_eq!(
        std::fs::read(directory.join("visit.wav")).expect("read"),
        b"RIFF audio"
    );
    assert!(!audio.exists());

    let in_place = coordinator
        .decrypt_appointment_files(id, None)
        .expect("decrypt in place");
    assert_eq!(in_place.directory, None);
    assert_eq!(in_place.files[0].decrypted_path, audio);
    assert_eq!(std::fs::read(&audio).expect("read"), b"RIFF audio");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_file_migration_runs_alongside_field_calls() {
    let clinic = Clinic::new();
    let id = clinic.appointment("A-001", "John Doe");
    for i in 0..6 {
        clinic.file(id, "A-001", &format!("part{i}.wav"), b"audio");
    }
    let coordinator = Arc::new(clinic.coordinator());
    coordinator.create_backup().expect("snapshot");

    let handle = coordinator.spawn_file_migration(2);
    for _ in 0..20 {
        let ciphertext = clinic.keys.encrypt_field("Jane Roe").expect("encrypt");
        assert_eq!(clinic.keys.decrypt_field(&ciphertext).expect("decrypt"), "Jane Roe");
    }

    let report = handle.await.expect("join").expect("migration");
    assert!(report.success);
    assert_eq!(report.migrated, 6);
    assert_eq!(report.batches, 3);
}
