//! Group lock.
//!
//! ```text
//! <config_dir>/
//! ├─ group.json    # Group description
//! ├─ lock          # Advisory lock, held while an engine is initialized
//! └─ archive.db    # Mapping archive
//! ```
//!
//! The lock file is removed when the engine finalizes. Finding it on disk
//! without anyone holding it means the previous engine did not shut down
//! cleanly.

use crate::error::{EngineError, EngineResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "lock";

/// How the lock was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No previous lock file.
    Clean,
    /// A lock file was left behind by a previous engine.
    Stale,
}

/// Exclusive lock on a group's configuration directory.
#[derive(Debug)]
pub struct GroupLock {
    path: PathBuf,
    file: File,
}

impl GroupLock {
    /// Acquires the lock in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another engine holds the lock.
    pub fn acquire(dir: &Path) -> EngineResult<(Self, LockState)> {
        fs::create_dir_all(dir)?;

        let path = dir.join(LOCK_FILE);
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(EngineError::Locked);
        }

        let state = if existed {
            warn!(path = %path.display(), "found stale group lock");
            LockState::Stale
        } else {
            LockState::Clean
        };
        debug!(path = %path.display(), "group locked");
        Ok((Self { path, file }, state))
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GroupLock {
    fn drop(&mut self) {
        // Remove before unlocking so a waiting engine never sees a stale file.
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "group unlocked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_lock_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let (lock, state) = GroupLock::acquire(dir.path()).unwrap();
        assert_eq!(state, LockState::Clean);
        assert!(lock.path().exists());

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_lock, _) = GroupLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            GroupLock::acquire(dir.path()),
            Err(EngineError::Locked)
        ));
    }

    #[test]
    fn leftover_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"").unwrap();

        let (_lock, state) = GroupLock::acquire(dir.path()).unwrap();
        assert_eq!(state, LockState::Stale);
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("groups").join("home");
        let (lock, _) = GroupLock::acquire(&nested).unwrap();
        assert!(lock.path().starts_with(&nested));
    }
}
