//! Cross-process lock on the data directory.
//!
//! The record store and the active log segment are held in memory by the
//! process that writes them, so only one process may own a data directory at
//! a time. Advisory `flock` via fs2; released when the guard drops or the
//! process dies.

use crate::error::{GuardError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the lock or fail with `Config` naming the lock file.
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::try_acquire(path)? {
            Some(lock) => Ok(lock),
            None => Err(GuardError::Config(format!(
                "data directory is in use by another fimguard process ({})",
                path.display()
            ))),
        }
    }

    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether some process currently holds the lock.
    pub fn is_held(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        matches!(Self::try_acquire(path), Ok(None))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
