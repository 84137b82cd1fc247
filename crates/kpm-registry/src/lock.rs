//! Advisory lock around a cache root.
//!
//! The cache performs no locking of its own. A process that mutates a
//! cache root acquires a [`CacheLock`] before resolution starts and holds it
//! until resolution ends; dropping the guard releases the lock on every exit
//! path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{RegistryError, Result};

/// Lock file name inside the cache root.
pub const LOCK_FILE_NAME: &str = ".kpm.lock";

/// An exclusive advisory lock on a cache root, released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Block until the lock on `root` is acquired.
    pub fn acquire(root: &Path) -> Result<Self> {
        let (file, path) = open_lock_file(root)?;
        file.lock_exclusive().map_err(|e| RegistryError::CacheLocked {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        debug!(path = %path.display(), "acquired cache lock");
        Ok(CacheLock { file, path })
    }

    /// Acquire the lock only if nobody else holds it.
    pub fn try_acquire(root: &Path) -> Result<Option<Self>> {
        let (file, path) = open_lock_file(root)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(CacheLock { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(RegistryError::CacheLocked {
                path,
                detail: e.to_string(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "released cache lock");
    }
}

fn open_lock_file(root: &Path) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(root).map_err(|e| RegistryError::CacheLocked {
        path: root.to_path_buf(),
        detail: format!("creating cache root: {e}"),
    })?;
    let path = root.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| RegistryError::CacheLocked {
            path: path.clone(),
            detail: e.to_string(),
        })?;
    Ok((file, path))
}
