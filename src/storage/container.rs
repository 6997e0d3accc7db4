//! Byte containers.
//!
//! A container is the seekable, growable byte space a block store lives
//! in. The trait lets the store run against a locked file in production
//! and against a plain buffer in tests.

use crate::error::{Result, StorageError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Trait for container I/O
pub trait Container {
    /// Read exactly `buf.len()` bytes starting at `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` starting at `offset`, growing the container if needed
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes
    fn len(&mut self) -> Result<u64>;

    /// Whether the container holds no bytes
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Grow or shrink to exactly `len` bytes
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flush written data to durable storage
    fn sync(&mut self) -> Result<()>;
}

/// File-backed container held under an exclusive advisory lock
pub struct FileContainer {
    file: File,
    path: PathBuf,
    sync_on_write: bool,
}

impl FileContainer {
    /// Open or create a file and lock it exclusively.
    ///
    /// Fails with `Locked` if another handle already holds the file.
    pub fn open(path: &Path, sync_on_write: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        tracing::debug!(path = %path.display(), "opened container");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            sync_on_write,
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and release the lock
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        FileExt::unlock(&self.file)?;
        tracing::debug!(path = %self.path.display(), "closed container");
        Ok(())
    }
}

impl Container for FileContainer {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        if self.sync_on_write {
            self.file.sync_data()?;
        }

        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory container
#[derive(Debug, Default, Clone)]
pub struct MemoryContainer {
    data: Vec<u8>,
}

impl MemoryContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw contents
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Container for MemoryContainer {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| StorageError::corruption(format!("offset {} out of range", offset)))?;
        let end = start.checked_add(buf.len()).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self.data[start..end]);
                Ok(())
            }
            None => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past end {}", buf.len(), offset, self.data.len()),
            ))),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| StorageError::corruption(format!("offset {} out of range", offset)))?;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| StorageError::invalid_operation(format!("length {} too large", len)))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_read_write() -> Result<()> {
        let mut c = MemoryContainer::new();
        assert!(c.is_empty()?);

        c.write_at(4, b"abcd")?;
        assert_eq!(c.len()?, 8);

        let mut buf = [0u8; 4];
        c.read_at(4, &mut buf)?;
        assert_eq!(&buf, b"abcd");

        assert!(matches!(c.read_at(6, &mut buf), Err(StorageError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_file_read_write_truncate() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        let mut c = FileContainer::open(&path, false)?;
        c.write_at(0, b"hello world")?;
        c.set_len(5)?;
        assert_eq!(c.len()?, 5);

        let mut buf = [0u8; 5];
        c.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"hello");
        c.close()?;

        Ok(())
    }

    #[test]
    fn test_file_is_exclusive() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        let first = FileContainer::open(&path, false)?;
        assert!(matches!(
            FileContainer::open(&path, false),
            Err(StorageError::Locked(_))
        ));

        first.close()?;
        let again = FileContainer::open(&path, false)?;
        assert_eq!(again.path(), path.as_path());

        Ok(())
    }
}
