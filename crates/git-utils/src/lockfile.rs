use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{LockError, UtilError};
use crate::Result;

const LOCK_SUFFIX: &str = ".lock";

/// RAII lock file guard protecting a single file that must be replaced
/// atomically (the `shallow` file, `FETCH_HEAD`).
///
/// Protocol:
/// - create `<path>.lock` with O_CREAT|O_EXCL; an existing lock file
///   means another process holds the lock
/// - write the new contents into the lock file
/// - `commit()` atomically renames `.lock` onto the target;
///   `commit_or_unlink()` removes the target instead when the new state
///   is empty
/// - dropping an uncommitted guard removes the `.lock` file, leaving the
///   live file exactly as it was
pub struct Lockfile {
    /// The protected file (without the .lock suffix).
    path: PathBuf,
    /// The lock file itself.
    lock_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl Lockfile {
    /// Acquire the lock for `path`, failing if it is already held.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = PathBuf::from(format!("{}{}", path.display(), LOCK_SUFFIX));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    UtilError::Lock(LockError::AlreadyLocked {
                        path: lock_path.clone(),
                    })
                } else {
                    UtilError::Lock(LockError::Create {
                        path: lock_path.clone(),
                        source: e,
                    })
                }
            })?;

        Ok(Self {
            path,
            lock_path,
            file: Some(file),
            committed: false,
        })
    }

    /// Non-blocking acquire: `Ok(None)` when another holder exists.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        match Self::acquire(path) {
            Ok(lk) => Ok(Some(lk)),
            Err(UtilError::Lock(LockError::AlreadyLocked { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The protected file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock file's path.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Commit: flush, fsync, and atomically rename `.lock` onto the
    /// target.
    pub fn commit(mut self) -> Result<()> {
        self.sync()?;
        self.file.take();

        fs::rename(&self.lock_path, &self.path).map_err(|e| {
            UtilError::Lock(LockError::Commit {
                path: self.lock_path.clone(),
                source: e,
            })
        })?;

        self.committed = true;
        Ok(())
    }

    /// Commit when content was written, or remove the target when the
    /// new state is empty (a repository that stopped being shallow has
    /// no `shallow` file at all).
    pub fn commit_or_unlink(self, empty: bool) -> Result<()> {
        if empty {
            let target = self.path.clone();
            self.rollback()?;
            if target.exists() {
                fs::remove_file(&target)?;
            }
            Ok(())
        } else {
            self.commit()
        }
    }

    /// Rollback: remove the `.lock` file, leaving the target untouched.
    /// Dropping the guard has the same effect.
    pub fn rollback(mut self) -> Result<()> {
        self.file.take();
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)?;
        }
        self.committed = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.flush()
                .and_then(|()| file.sync_all())
                .map_err(|e| {
                    UtilError::Lock(LockError::Commit {
                        path: self.lock_path.clone(),
                        source: e,
                    })
                })?;
        }
        Ok(())
    }
}

impl Write for Lockfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .flush()
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shallow");
        fs::write(&target, b"old contents\n").unwrap();

        let mut lock = Lockfile::acquire(&target).unwrap();
        assert!(lock.lock_path().exists());
        lock.write_all(b"new contents\n").unwrap();
        lock.commit().unwrap();

        assert!(!dir.path().join("shallow.lock").exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "new contents\n");
    }

    #[test]
    fn rollback_keeps_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shallow");
        fs::write(&target, b"original").unwrap();

        let mut lock = Lockfile::acquire(&target).unwrap();
        lock.write_all(b"should not persist").unwrap();
        lock.rollback().unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
        assert!(!dir.path().join("shallow.lock").exists());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shallow");
        fs::write(&target, b"original").unwrap();

        {
            let mut lock = Lockfile::acquire(&target).unwrap();
            lock.write_all(b"dropped").unwrap();
        }

        assert!(!dir.path().join("shallow.lock").exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
    }

    #[test]
    fn second_holder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shallow");

        let _lock1 = Lockfile::acquire(&target).unwrap();
        match Lockfile::acquire(&target) {
            Err(UtilError::Lock(LockError::AlreadyLocked { .. })) => {}
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|_| ())),
        }
        assert!(Lockfile::try_acquire(&target).unwrap().is_none());
    }

    #[test]
    fn commit_or_unlink_removes_target_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shallow");
        fs::write(&target, b"deadbeef\n").unwrap();

        let lock = Lockfile::acquire(&target).unwrap();
        lock.commit_or_unlink(true).unwrap();

        assert!(!target.exists());
        assert!(!dir.path().join("shallow.lock").exists());
    }

    #[test]
    fn creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("FETCH_HEAD");

        let mut lock = Lockfile::acquire(&target).unwrap();
        lock.write_all(b"created via lock").unwrap();
        lock.commit().unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "created via lock");
    }
}
