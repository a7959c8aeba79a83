//! Advisory locks serializing mutations of one data directory.
//!
//! Layer mutations lock `<data>/.lock`; the instance registry locks its own
//! directory.

use std::fs::File;
use std::path::Path;

use fim_common::error::{FimError, Result};

/// Exclusive `flock(2)` held until dropped.
#[derive(Debug)]
pub struct DataLock {
    _flock: nix::fcntl::Flock<File>,
}

impl DataLock {
    /// Blocks until the exclusive lock on `path` is acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FimError::io(parent, e))?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| FimError::io(path, e))?;
        tracing::debug!(path = %path.display(), "waiting for lock");
        let flock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_, errno)| FimError::io(path, errno.into()))?;
        Ok(Self { _flock: flock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        drop(DataLock::acquire(&path).expect("first"));
        let _again = DataLock::acquire(&path).expect("second");
        assert!(path.exists());
    }

    #[test]
    fn held_lock_excludes_other_descriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let _held = DataLock::acquire(&path).expect("lock");
        let other = File::open(&path).expect("open");
        let attempt = nix::fcntl::Flock::lock(other, nix::fcntl::FlockArg::LockExclusiveNonblock);
        assert!(attempt.is_err());
    }
}
