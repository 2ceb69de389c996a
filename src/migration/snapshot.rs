//! Pre-migration snapshot of the clinic database and data directory.
//!
//! Layout:
//!
//! ```text
//! <destination>/
//!   clinic_data_backup.db    consistent copy (VACUUM INTO)
//!   data_backup/             copy of the data directory
//!   backup_metadata.json
//! ```
//!
//! Everything is staged in `.<name>.partial` next to the destination and
//! renamed into place at the end. A failure removes the staging directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::report::SnapshotInfo;
use super::store::RecordStore;
use crate::error::{Result, VaultError};

pub const DATABASE_BACKUP_NAME: &str = "clinic_data_backup.db";
pub const DATA_BACKUP_NAME: &str = "data_backup";
pub const METADATA_NAME: &str = "backup_metadata.json";
const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Serialize)]
struct SnapshotMetadata<'a> {
    backup_created: DateTime<Utc>,
    database_path: Option<&'a Path>,
    data_dir: &'a Path,
    backup_type: &'static str,
    version: &'static str,
    files_copied: usize,
}

/// Default snapshot directory name under the snapshot root.
pub fn snapshot_dir_name(now: DateTime<Utc>) -> String {
    format!("migration_backup_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Snapshot `store` and `data_dir` into `destination`.
///
/// `excluded` paths (and their contents) are left out of the data copy, in
/// addition to the live database file and the snapshot itself.
pub fn create_snapshot(
    store: &dyn RecordStore,
    data_dir: &Path,
    destination: &Path,
    excluded: &[&Path],
    now: DateTime<Utc>,
) -> Result<SnapshotInfo> {
    if destination.exists() {
        return Err(VaultError::Migration(format!(
            "snapshot destination already exists: {}",
            destination.display()
        )));
    }
    let name = destination
        .file_name()
        .ok_or_else(|| {
            VaultError::Migration(format!("invalid snapshot path {}", destination.display()))
        })?
        .to_string_lossy()
        .into_owned();
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staging = parent.join(format!(".{name}.partial"));
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| VaultError::io(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| VaultError::io(&staging, e))?;

    match build(store, data_dir, &staging, destination, excluded, now) {
        Ok(files_copied) => {
            std::fs::rename(&staging, destination)
                .map_err(|e| VaultError::io(destination, e))
                .inspect_err(|_| discard(&staging))?;
            let database_backup = destination.join(DATABASE_BACKUP_NAME);
            let info = SnapshotInfo {
                path: destination.to_path_buf(),
                database_backup: database_backup.exists().then_some(database_backup),
                data_backup: destination.join(DATA_BACKUP_NAME),
                files_copied,
                created: now,
            };
            info!(
                path = %destination.display(),
                files = files_copied,
                "Created migration snapshot"
            );
            Ok(info)
        }
        Err(e) => {
            discard(&staging);
            Err(e)
        }
    }
}

fn discard(staging: &Path) {
    if let Err(e) = std::fs::remove_dir_all(staging) {
        warn!(path = %staging.display(), error = %e, "Could not remove partial snapshot");
    }
}

fn build(
    store: &dyn RecordStore,
    data_dir: &Path,
    staging: &Path,
    destination: &Path,
    excluded: &[&Path],
    now: DateTime<Utc>,
) -> Result<usize> {
    store.snapshot_to(&staging.join(DATABASE_BACKUP_NAME))?;

    let data_root = data_dir
        .canonicalize()
        .map_err(|e| VaultError::io(data_dir, e))?;
    let mut skip: Vec<PathBuf> = vec![normalize(staging), normalize(destination)];
    skip.extend(excluded.iter().map(|p| normalize(p)));
    if let Some(db) = store.database_path() {
        let db = normalize(db);
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut sidecar = db.clone().into_os_string();
            sidecar.push(suffix);
            skip.push(PathBuf::from(sidecar));
        }
        skip.push(db);
    }

    let data_backup = staging.join(DATA_BACKUP_NAME);
    std::fs::create_dir_all(&data_backup).map_err(|e| VaultError::io(&data_backup, e))?;

    let mut files_copied = 0;
    let walker = WalkDir::new(&data_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !skip.iter().any(|p| p == entry.path()));
    for entry in walker {
        let entry = entry.map_err(|e| VaultError::Migration(format!("walking data dir: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(&data_root)
            .map_err(|e| VaultError::Migration(format!("walking data dir: {e}")))?;
        let target = data_backup.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| VaultError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).map_err(|e| VaultError::io(entry.path(), e))?;
            files_copied += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file in snapshot");
        }
    }

    let metadata = SnapshotMetadata {
        backup_created: now,
        database_path: store.database_path(),
        data_dir,
        backup_type: "migration_backup",
        version: SNAPSHOT_VERSION,
        files_copied,
    };
    let metadata_path = staging.join(METADATA_NAME);
    std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
        .map_err(|e| VaultError::io(&metadata_path, e))?;
    Ok(files_copied)
}

/// Canonical form of `path`, resolving through the parent when `path`
/// itself does not exist yet.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
