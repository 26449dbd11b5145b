//! On-disk persistence of the commit log.
//!
//! `.filament/journal.jsonl` holds one commit per line in append order.
//! Loading re-appends every line into a fresh [`FilamentStore`], so the
//! journal is checked against the same sequence and causality rules as live
//! appends, and every stored hash is recomputed.
//!
//! A crash mid-write can leave a partial final line. Loads ignore it with a
//! warning; the next locked write truncates it before appending.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{self, FILAMENT_DIR};
use crate::error::{ErrorCode, GraphError};
use crate::lock::{JournalLock, LockError};
use crate::model::Commit;
use crate::store::FilamentStore;

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const LOCK_FILE: &str = "journal.lock";

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("{}: no .filament directory at {}", ErrorCode::NotInitialized, .0.display())]
    NotInitialized(PathBuf),

    #[error("{}: line {}: {}", ErrorCode::JournalCorrupt, .line, .detail)]
    Corrupt { line: usize, detail: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{}: {}", ErrorCode::JournalWriteFailed, .0)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl JournalError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized(_) => ErrorCode::NotInitialized,
            Self::Corrupt { .. } => ErrorCode::JournalCorrupt,
            Self::Lock(e) => e.code(),
            Self::Io(_) => ErrorCode::JournalWriteFailed,
            Self::Graph(e) => e.code(),
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Handle on a `.filament` directory.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl Journal {
    /// Open the journal under `root/.filament`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::NotInitialized`] if the directory is missing.
    pub fn open(root: &Path, lock_timeout: Duration) -> Result<Self, JournalError> {
        let dir = root.join(FILAMENT_DIR);
        if !dir.is_dir() {
            return Err(JournalError::NotInitialized(root.to_path_buf()));
        }
        Ok(Self { dir, lock_timeout })
    }

    /// Create `root/.filament` with a default config and an empty journal.
    /// Existing files are left alone.
    ///
    /// Returns the handle and whether anything was created.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] if the directory or files cannot be
    /// written.
    pub fn init(root: &Path, lock_timeout: Duration) -> Result<(Self, bool), JournalError> {
        let dir = root.join(FILAMENT_DIR);
        fs::create_dir_all(&dir)?;
        let mut created = false;

        let config_path = config::project_config_path(root);
        if !config_path.exists() {
            let rendered = config::default_config_toml()
                .map_err(|e| io::Error::other(format!("{e:#}")))?;
            fs::write(&config_path, rendered)?;
            created = true;
        }

        let journal = Self { dir, lock_timeout };
        if !journal.journal_path().exists() {
            fs::File::create(journal.journal_path())?;
            created = true;
        }
        tracing::info!(dir = %journal.dir.display(), created, "journal initialized");
        Ok((journal, created))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Rebuild a store from the journal under a shared lock.
    ///
    /// # Errors
    ///
    /// [`JournalError::Corrupt`] for a line that does not parse, fails
    /// validation or carries the wrong hash; lock and I/O errors otherwise.
    pub fn load(&self) -> Result<FilamentStore, JournalError> {
        let _lock = JournalLock::shared(&self.lock_path(), self.lock_timeout)?;
        self.load_unlocked()
    }

    /// Load, run `f` against the store, and persist whatever it appended.
    ///
    /// The exclusive lock is held for the whole read-modify-write, so
    /// concurrent `fil` processes serialize here. If `f` fails nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or any load, lock or write error.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut FilamentStore) -> Result<T, GraphError>,
    ) -> Result<T, JournalError> {
        let _lock = JournalLock::exclusive(&self.lock_path(), self.lock_timeout)?;
        self.repair_unlocked()?;
        let mut store = self.load_unlocked()?;
        let mark = store.len();

        let out = f(&mut store)?;

        let lines = store
            .appended_since(mark)
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(io::Error::other)?;
        if !lines.is_empty() {
            self.write_lines(&lines)?;
            tracing::debug!(commits = lines.len(), "journal appended");
        }
        Ok(out)
    }

    /// Truncate a torn trailing line, if any. Returns the bytes removed.
    ///
    /// # Errors
    ///
    /// Lock or I/O errors.
    pub fn repair(&self) -> Result<Option<u64>, JournalError> {
        let _lock = JournalLock::exclusive(&self.lock_path(), self.lock_timeout)?;
        self.repair_unlocked()
    }

    fn load_unlocked(&self) -> Result<FilamentStore, JournalError> {
        let content = match fs::read_to_string(self.journal_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let (complete, torn) = split_torn_tail(&content);
        if !torn.is_empty() {
            tracing::warn!(
                bytes = torn.len(),
                path = %self.journal_path().display(),
                "ignoring torn trailing journal line"
            );
        }

        let mut store = FilamentStore::new();
        for (i, raw) in complete.lines().enumerate() {
            let line = i + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let commit: Commit = serde_json::from_str(raw).map_err(|e| JournalError::Corrupt {
                line,
                detail: e.to_string(),
            })?;
            let stored_hash = commit.commit_hash.clone();
            let commit_ref = store.append(commit).map_err(|e| JournalError::Corrupt {
                line,
                detail: e.to_string(),
            })?;
            let recomputed = store
                .commit(&commit_ref)
                .map(|c| c.commit_hash.as_str())
                .unwrap_or_default();
            if recomputed != stored_hash {
                return Err(JournalError::Corrupt {
                    line,
                    detail: format!(
                        "{commit_ref} stored hash {stored_hash} but content hashes to {recomputed}"
                    ),
                });
            }
        }
        tracing::debug!(commits = store.len(), "journal loaded");
        Ok(store)
    }

    fn repair_unlocked(&self) -> Result<Option<u64>, JournalError> {
        let path = self.journal_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let keep = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        if keep == content.len() {
            return Ok(None);
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(keep as u64)?;
        let removed = (content.len() - keep) as u64;
        tracing::warn!(bytes = removed, path = %path.display(), "truncated torn journal line");
        Ok(Some(removed))
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), JournalError> {
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Split `content` into its newline-terminated prefix and any partial tail.
fn split_torn_tail(content: &str) -> (&str, &str) {
    content
        .rfind('\n')
        .map_or(("", content), |pos| content.split_at(pos + 1))
}
