//! One-time conversion of plaintext clinic data to encrypted form.

mod cancel;
mod coordinator;
mod report;
mod snapshot;
mod state;
mod store;

pub use cancel::CancelToken;
pub use coordinator::MigrationCoordinator;
pub use report::{
    AppointmentDecryptReport, DecryptedFile, FileMigrationReport, FullMigrationReport,
    ItemDetail, ItemStatus, MigrationStatus, RecordMigrationReport, SnapshotInfo,
    VerificationReport,
};
pub use snapshot::{create_snapshot, snapshot_dir_name};
pub use state::MigrationState;
pub use store::{
    AppointmentRow, EncryptedAppointment, EncryptedFileColumns, EncryptionCounts, FileRow,
    NewAppointment, NewFile, RecordStore, SqliteRecordStore,
};
