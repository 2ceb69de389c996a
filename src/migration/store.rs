//! The migration's view of the clinic database.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::policy::requires_encryption;

/// An appointment row as the migration sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRow {
    pub appointment_id: i64,
    pub patient_name: Option<String>,
    pub notes: Option<String>,
    pub folder_path: Option<String>,
    pub patient_name_encrypted: Option<String>,
    pub notes_encrypted: Option<String>,
    pub folder_path_encrypted: Option<String>,
    pub encryption_key_id: Option<String>,
    pub is_encrypted: bool,
}

/// A non-deleted file row, with whether its owning appointment exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub file_id: i64,
    pub appointment_id: i64,
    pub file_path: Option<String>,
    pub file_path_encrypted: Option<String>,
    pub file_hash_encrypted: Option<String>,
    pub is_encrypted: bool,
    pub owner_exists: bool,
}

/// Ciphertext columns written when an appointment is migrated.
#[derive(Debug, Clone)]
pub struct EncryptedAppointment {
    pub patient_name: String,
    pub notes: String,
    pub folder_path: String,
    pub key_id: String,
}

/// Ciphertext columns written when a file is migrated.
#[derive(Debug, Clone)]
pub struct EncryptedFileColumns {
    pub file_path: String,
    pub file_hash: String,
    pub key_id: String,
}

/// `exempt` counts unencrypted files whose type needs no encryption; they
/// are not part of `unencrypted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EncryptionCounts {
    pub total: u64,
    pub encrypted: u64,
    pub unencrypted: u64,
    pub exempt: u64,
}

impl EncryptionCounts {
    fn from_totals(total: i64, encrypted: i64) -> Self {
        let total = total.max(0) as u64;
        let encrypted = encrypted.max(0) as u64;
        Self {
            total,
            encrypted,
            unencrypted: total.saturating_sub(encrypted),
            exempt: 0,
        }
    }
}

/// Storage seam for the migration coordinator.
pub trait RecordStore: Send + Sync {
    fn appointment_counts(&self) -> Result<EncryptionCounts>;

    fn file_counts(&self) -> Result<EncryptionCounts>;

    /// Every appointment, encrypted or not.
    fn appointments(&self) -> Result<Vec<AppointmentRow>>;

    /// Appointments whose `is_encrypted` flag is unset.
    fn unencrypted_appointments(&self) -> Result<Vec<AppointmentRow>>;

    /// Write ciphertext columns and clear the plaintext ones in one update.
    fn mark_appointment_encrypted(
        &self,
        appointment_id: i64,
        columns: &EncryptedAppointment,
    ) -> Result<()>;

    /// Every non-deleted file.
    fn active_files(&self) -> Result<Vec<FileRow>>;

    /// Non-deleted files of one appointment.
    fn appointment_files(&self, appointment_id: i64) -> Result<Vec<FileRow>>;

    fn mark_file_encrypted(&self, file_id: i64, columns: &EncryptedFileColumns) -> Result<()>;

    /// Write a consistent copy of the database to `destination`.
    fn snapshot_to(&self, destination: &Path) -> Result<()>;

    /// Path of the live database file, if it has one.
    fn database_path(&self) -> Option<&Path>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS appointments (
        appointment_id INTEGER PRIMARY KEY AUTOINCREMENT,
        appointment_code TEXT UNIQUE NOT NULL,
        patient_name TEXT NOT NULL,
        appointment_date DATE NOT NULL,
        appointment_time TIME NOT NULL,
        appointment_type TEXT,
        notes TEXT,
        folder_path TEXT NOT NULL,
        created_date TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS files (
        file_id INTEGER PRIMARY KEY AUTOINCREMENT,
        appointment_id INTEGER NOT NULL,
        file_type TEXT NOT NULL,
        file_path TEXT NOT NULL,
        file_size INTEGER,
        file_hash TEXT,
        created_date TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        retention_policy TEXT NOT NULL,
        retention_date DATE NOT NULL,
        is_deleted BOOLEAN DEFAULT 0,
        deletion_date TIMESTAMP
    );
";

const ENCRYPTION_COLUMNS: &[(&str, &str, &str)] = &[
    ("appointments", "patient_name_encrypted", "TEXT"),
    ("appointments", "notes_encrypted", "TEXT"),
    ("appointments", "folder_path_encrypted", "TEXT"),
    ("appointments", "encryption_key_id", "VARCHAR(255)"),
    ("appointments", "is_encrypted", "BOOLEAN DEFAULT 0"),
    ("files", "file_path_encrypted", "TEXT"),
    ("files", "file_hash_encrypted", "TEXT"),
    ("files", "encryption_key_id", "VARCHAR(255)"),
    ("files", "is_encrypted", "BOOLEAN DEFAULT 0"),
];

const APPOINTMENT_COLUMNS: &str = "appointment_id, patient_name, notes, folder_path, \
     patient_name_encrypted, notes_encrypted, folder_path_encrypted, encryption_key_id, \
     COALESCE(is_encrypted, 0)";

/// New appointment, for seeding a database.
#[derive(Debug, Clone)]
pub struct NewAppointment<'a> {
    pub appointment_code: &'a str,
    pub patient_name: &'a str,
    pub appointment_date: &'a str,
    pub appointment_time: &'a str,
    pub notes: Option<&'a str>,
    pub folder_path: &'a str,
}

/// New file row, for seeding a database.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub appointment_id: i64,
    pub file_type: &'a str,
    pub file_path: &'a str,
    pub retention_policy: &'a str,
    pub retention_date: &'a str,
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRecordStore {
    /// Open the clinic database, creating the tables and encryption columns
    /// it is missing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        ensure_encryption_columns(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn insert_appointment(&self, appointment: &NewAppointment<'_>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO appointments
                (appointment_code, patient_name, appointment_date, appointment_time,
                 notes, folder_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                appointment.appointment_code,
                appointment.patient_name,
                appointment.appointment_date,
                appointment.appointment_time,
                appointment.notes,
                appointment.folder_path,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_file(&self, file: &NewFile<'_>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO files
                (appointment_id, file_type, file_path, retention_policy, retention_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.appointment_id,
                file.file_type,
                file.file_path,
                file.retention_policy,
                file.retention_date,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn appointment(&self, appointment_id: i64) -> Result<Option<AppointmentRow>> {
        let sql =
            format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE appointment_id = ?1");
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &sql,
                params![appointment_id],
                appointment_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn query_files<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<FileRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT f.file_id, f.appointment_id, f.file_path, f.file_path_encrypted,
                    f.file_hash_encrypted, COALESCE(f.is_encrypted, 0),
                    a.appointment_id IS NOT NULL
             FROM files f
             LEFT JOIN appointments a ON a.appointment_id = f.appointment_id
             WHERE COALESCE(f.is_deleted, 0) = 0 {filter}
             ORDER BY f.file_id"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(FileRow {
                    file_id: row.get(0)?,
                    appointment_id: row.get(1)?,
                    file_path: row.get(2)?,
                    file_path_encrypted: row.get(3)?,
                    file_hash_encrypted: row.get(4)?,
                    is_encrypted: row.get(5)?,
                    owner_exists: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_appointments(&self, filter: &str) -> Result<Vec<AppointmentRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments {filter} ORDER BY appointment_id"
        ))?;
        let rows = stmt
            .query_map([], appointment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn appointment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppointmentRow> {
    Ok(AppointmentRow {
        appointment_id: row.get(0)?,
        patient_name: row.get(1)?,
        notes: row.get(2)?,
        folder_path: row.get(3)?,
        patient_name_encrypted: row.get(4)?,
        notes_encrypted: row.get(5)?,
        folder_path_encrypted: row.get(6)?,
        encryption_key_id: row.get(7)?,
        is_encrypted: row.get(8)?,
    })
}

/// Add the encryption columns to an existing plaintext database.
fn ensure_encryption_columns(conn: &Connection) -> Result<()> {
    for (table, column, decl) in ENCRYPTION_COLUMNS {
        match conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), []) {
            Ok(_) => debug!(table, column, "Added encryption column"),
            Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                if msg.contains("duplicate column name") => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl RecordStore for SqliteRecordStore {
    fn appointment_counts(&self) -> Result<EncryptionCounts> {
        let conn = self.conn.lock();
        let (total, encrypted) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_encrypted = 1 THEN 1 ELSE 0 END), 0)
             FROM appointments",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(EncryptionCounts::from_totals(total, encrypted))
    }

    fn file_counts(&self) -> Result<EncryptionCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, COALESCE(is_encrypted, 0)
             FROM files WHERE COALESCE(is_deleted, 0) = 0",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, bool>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = EncryptionCounts::default();
        for (path, encrypted) in rows {
            counts.total += 1;
            let exempt = path
                .as_deref()
                .is_some_and(|p| !p.is_empty() && !requires_encryption(Path::new(p)));
            if encrypted {
                counts.encrypted += 1;
            } else if exempt {
                counts.exempt += 1;
            } else {
                counts.unencrypted += 1;
            }
        }
        Ok(counts)
    }

    fn appointments(&self) -> Result<Vec<AppointmentRow>> {
        self.query_appointments("")
    }

    fn unencrypted_appointments(&self) -> Result<Vec<AppointmentRow>> {
        self.query_appointments("WHERE COALESCE(is_encrypted, 0) = 0")
    }

    fn mark_appointment_encrypted(
        &self,
        appointment_id: i64,
        columns: &EncryptedAppointment,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE appointments SET
                patient_name = '', notes = NULL, folder_path = '',
                patient_name_encrypted = ?1, notes_encrypted = ?2, folder_path_encrypted = ?3,
                encryption_key_id = ?4, is_encrypted = 1
             WHERE appointment_id = ?5",
            params![
                columns.patient_name,
                columns.notes,
                columns.folder_path,
                columns.key_id,
                appointment_id,
            ],
        )?;
        if updated != 1 {
            return Err(VaultError::Migration(format!(
                "appointment {appointment_id} not found"
            )));
        }
        Ok(())
    }

    fn active_files(&self) -> Result<Vec<FileRow>> {
        self.query_files("", [])
    }

    fn appointment_files(&self, appointment_id: i64) -> Result<Vec<FileRow>> {
        self.query_files("AND f.appointment_id = ?1", [appointment_id])
    }

    fn mark_file_encrypted(&self, file_id: i64, columns: &EncryptedFileColumns) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE files SET
                file_path = '', file_hash = NULL,
                file_path_encrypted = ?1, file_hash_encrypted = ?2,
                encryption_key_id = ?3, is_encrypted = 1
             WHERE file_id = ?4",
            params![columns.file_path, columns.file_hash, columns.key_id, file_id],
        )?;
        if updated != 1 {
            return Err(VaultError::Migration(format!("file {file_id} not found")));
        }
        Ok(())
    }

    fn snapshot_to(&self, destination: &Path) -> Result<()> {
        let target = destination.to_str().ok_or_else(|| {
            VaultError::Migration(format!(
                "snapshot path is not valid UTF-8: {}",
                destination.display()
            ))
        })?;
        let conn = self.conn.lock();
        conn.execute("VACUUM INTO ?1", params![target])?;
        Ok(())
    }

    fn database_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
