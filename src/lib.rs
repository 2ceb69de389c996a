//! Encryption subsystem for clinic records.
//!
//! [`KeyManager`] owns the key store and is the one handle collaborators
//! need: field and file encryption, rotation, and password-protected key
//! backups. [`MigrationCoordinator`] converts an existing plaintext database
//! and data directory to encrypted form.

pub mod backup;
pub mod cipher;
pub mod config;
pub mod error;
pub mod fs;
pub mod keys;
pub mod migration;
pub mod policy;
pub mod scratch;

pub use cipher::{EncryptedFile, FieldCipher, FileCipher};
pub use config::{CorruptStorePolicy, KeyConfig, MigrationConfig, ScratchConfig, VaultConfig};
pub use error::{MigrationItemError, Result, VaultError};
pub use keys::{KeyInfo, KeyManager, KeyProvider, KeyRecord};
pub use migration::{
    AppointmentDecryptReport, CancelToken, FileMigrationReport, MigrationCoordinator,
    MigrationState, MigrationStatus, RecordMigrationReport, RecordStore, SqliteRecordStore,
    VerificationReport,
};
pub use policy::{requires_encryption, FileCategory};
pub use scratch::{ScratchDir, SweepReport};
