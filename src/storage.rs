//! Storage directory preparation.
//!
//! Every node keeps its replicated log, commit marker and local database in
//! one directory. [`prepare`] creates it and makes it the working directory,
//! so nodes started with identical relative paths still keep their data
//! apart. The returned absolute path is handed to collaborators explicitly.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::StorageError;

/// Permission bits for a freshly created storage directory.
#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Create `directory` (and missing ancestors), then change into it.
///
/// Idempotent for an existing directory. Returns the absolute path of the
/// new working directory.
pub fn prepare(directory: &Path) -> Result<PathBuf, StorageError> {
    create_dir(directory).map_err(|source| StorageError::CreateFailed {
        path: directory.to_path_buf(),
        source,
    })?;

    info!(directory = %directory.display(), "Changing to storage directory");
    std::env::set_current_dir(directory).map_err(|source| StorageError::ChdirFailed {
        path: directory.to_path_buf(),
        source,
    })?;

    std::env::current_dir().map_err(|source| StorageError::ChdirFailed {
        path: directory.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn create_dir(directory: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(directory)
}

#[cfg(not(unix))]
fn create_dir(directory: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(directory)
}
