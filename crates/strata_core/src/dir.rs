//! Tree directory ownership.
//!
//! A tree directory holds one file per page plus a `LOCK` file:
//!
//! ```text
//! <tree>/
//! ├─ LOCK      # Advisory lock for single-process access
//! ├─ 0.0       # Root branch, version 0
//! ├─ 1.3       # Left-most leaf, version 3
//! └─ ...
//! ```
//!
//! The lock is held for as long as the [`TreeDir`] lives.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use strata_storage::StorageError;

const LOCK_FILE: &str = "LOCK";

/// Exclusive handle on a tree directory.
#[derive(Debug)]
pub struct TreeDir {
    path: PathBuf,
    _lock_file: File,
}

impl TreeDir {
    /// Locks the tree directory at `path`.
    ///
    /// When `create_if_missing` is set a missing directory is created first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory is missing and may not be
    /// created, `NotADirectory` if the path is a file, or `DatabaseLocked` if
    /// another handle holds the lock.
    pub fn lock(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        match fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::NotADirectory {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && create_if_missing => {
                fs::create_dir_all(path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The locked directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("tree");

        let dir = TreeDir::lock(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join("LOCK").exists());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn missing_directory_is_not_created_on_open() {
        let temp = tempdir().unwrap();
        let result = TreeDir::lock(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn file_is_not_a_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("plain");
        fs::write(&path, b"x").unwrap();

        let result = TreeDir::lock(&path, true);
        assert!(matches!(
            result,
            Err(CoreError::Storage(StorageError::NotADirectory { .. }))
        ));
    }

    #[test]
    fn lock_prevents_second_handle() {
        let temp = tempdir().unwrap();
        let _first = TreeDir::lock(temp.path(), true).unwrap();
        let second = TreeDir::lock(temp.path(), true);
        assert!(matches!(second, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(TreeDir::lock(temp.path(), true).unwrap());
        let _again = TreeDir::lock(temp.path(), true).unwrap();
    }
}
