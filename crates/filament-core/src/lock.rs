//! Advisory file locks serializing journal access across processes.
//!
//! Within one process a `&mut FilamentStore` is already the single writer.
//! Between processes, every journal append holds an exclusive lock and every
//! load holds a shared one.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::ErrorCode;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: lock on {} not acquired after {:?}", ErrorCode::LockContention, .path.display(), .waited)]
    Timeout { path: PathBuf, waited: Duration },

    #[error("{}: lock file error: {}", ErrorCode::JournalWriteFailed, .0)]
    Io(#[from] io::Error),
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::JournalWriteFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// RAII guard over an advisory lock. Released on drop.
#[derive(Debug)]
pub struct JournalLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl JournalLock {
    /// Acquire an exclusive lock for writing.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if another holder keeps the lock past
    /// `timeout`, or [`LockError::Io`] if the lock file cannot be opened.
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Self::acquire(path, timeout, LockMode::Exclusive)
    }

    /// Acquire a shared lock for reading.
    ///
    /// # Errors
    ///
    /// Same as [`JournalLock::exclusive`].
    pub fn shared(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Self::acquire(path, timeout, LockMode::Shared)
    }

    fn acquire(path: &Path, timeout: Duration, mode: LockMode) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            if attempt.is_ok() {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                    mode,
                });
            }
            if started.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
