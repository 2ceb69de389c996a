//! Filesystem utilities for atomic, owner-only writes.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, VaultError};

/// Atomically replace `destination` with `contents`.
///
/// The bytes go to a temp file in the destination directory, are flushed
/// to disk, and the temp file is renamed over the destination. On Unix the
/// file is owner read/write only. A failure at any point leaves the previous
/// destination (if any) untouched and no temp file behind.
pub fn write_atomic(destination: &Path, contents: &[u8]) -> Result<()> {
    let dir = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| VaultError::io(dir, e))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| VaultError::io(dir, e))?;
    temp.write_all(contents)
        .map_err(|e| VaultError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| VaultError::io(temp.path(), e))?;
    restrict_permissions(temp.path())?;

    temp.persist(destination)
        .map_err(|e| VaultError::io(destination, e.error))?;
    Ok(())
}

/// Set owner read/write only. No-op outside Unix.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| VaultError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
