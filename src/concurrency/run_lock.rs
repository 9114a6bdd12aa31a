//! Cross-process run lock using advisory file locking (fs2 flock).
//!
//! Only one mutating bulk run (apply-all, remove-all) may touch the policy
//! stores at a time, whichever process starts it.

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::PathBuf;

use crate::paths::Paths;

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct RunLockGuard {
    file: File,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl RunLock {
    /// Lock file in the runtime directory (or state directory fallback).
    pub fn new(paths: &Paths) -> Result<Self> {
        Self::at(paths.run_lock())
    }

    pub fn at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Blocking acquire.
    pub fn acquire(&self) -> Result<RunLockGuard> {
        let file = File::create(&self.path)?;
        file.lock_exclusive()?;
        Ok(RunLockGuard { file })
    }

    /// Non-blocking acquire; `None` when another run holds the lock.
    pub fn try_acquire(&self) -> Result<Option<RunLockGuard>> {
        let file = File::create(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RunLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
