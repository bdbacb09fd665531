//! Append-only page files.

use crate::error::StorageResult;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single page version file, opened for positioned reads and appends.
///
/// # Durability
///
/// - `append()` hands the bytes to the OS with a single `write_all`
/// - `sync()` calls `File::sync_data()` to ensure data is on disk
#[derive(Debug)]
pub struct PageFile {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl PageFile {
    /// Opens an existing page file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).append(true).open(path)?;
        Self::from_file(path, file)
    }

    /// Creates a new page file, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(path)?;
        Self::from_file(path, file)
    }

    fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        *self.size.read()
    }

    /// Reads up to `len` bytes starting at `offset`, stopping at end of file.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    pub fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let len = len.min(available);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Appends data to the end of the file, returning the offset it starts at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    pub fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        if !data.is_empty() {
            file.write_all(data)?;
            file.flush()?;
            *size += data.len() as u64;
        }

        Ok(offset)
    }

    /// Cuts the file back to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    pub fn truncate(&self, len: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();
        file.set_len(len)?;
        *size = len.min(*size);
        Ok(())
    }

    /// Syncs file contents to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_data()?;
        Ok(())
    }
}

/// Deletes `path`, treating a missing file as already deleted.
pub(crate) fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Makes renames and unlinks within `directory` durable.
#[cfg(unix)]
pub(crate) fn sync_directory(directory: &Path) -> StorageResult<()> {
    File::open(directory)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_directory: &Path) -> StorageResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.0");

        let file = PageFile::create(&path).unwrap();
        assert_eq!(file.size(), 0);
        assert!(path.exists());
        assert_eq!(file.path(), path);
    }

    #[test]
    fn file_create_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.0");

        PageFile::create(&path).unwrap();
        assert!(PageFile::create(&path).is_err());
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let file = PageFile::create(&dir.path().join("1.0")).unwrap();

        assert_eq!(file.append(b"hello").unwrap(), 0);
        assert_eq!(file.append(b" world").unwrap(), 5);
        assert_eq!(file.size(), 11);

        assert_eq!(file.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(file.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn file_read_clamps_at_end() {
        let dir = tempdir().unwrap();
        let file = PageFile::create(&dir.path().join("1.0")).unwrap();
        file.append(b"hello").unwrap();

        assert_eq!(file.read_at(3, 100).unwrap(), b"lo");
        assert!(file.read_at(10, 5).unwrap().is_empty());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3.2");

        {
            let file = PageFile::create(&path).unwrap();
            file.append(b"persistent data").unwrap();
            file.sync().unwrap();
        }

        let file = PageFile::open(&path).unwrap();
        assert_eq!(file.size(), 15);
        assert_eq!(file.read_at(0, 15).unwrap(), b"persistent data");
        assert_eq!(file.append(b"!").unwrap(), 15);
    }

    #[test]
    fn file_truncate_drops_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.0");
        let file = PageFile::create(&path).unwrap();
        file.append(b"kept torn").unwrap();

        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        assert_eq!(file.append(b"!").unwrap(), 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"kept!");
    }

    #[test]
    fn remove_if_exists_ignores_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        remove_if_exists(&path).unwrap();

        std::fs::write(&path, b"x").unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn file_empty_append() {
        let dir = tempdir().unwrap();
        let file = PageFile::create(&dir.path().join("1.0")).unwrap();
        file.append(b"x").unwrap();

        assert_eq!(file.append(b"").unwrap(), 1);
        assert_eq!(file.size(), 1);
    }
}
