use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::backend::{end_offset, StorageBackend};
use crate::error::{DiskError, Result};

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// File-backed storage using positioned I/O.
///
/// Reads past EOF fail `OutOfBounds`; writes past EOF extend the file and the
/// hole reads back as zeros (sparse where the filesystem supports it).
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    read_only: bool,
}

impl FileBackend {
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(DiskError::io)?;
        file.set_len(len).map_err(DiskError::io)?;
        Ok(Self {
            file,
            read_only: false,
        })
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(DiskError::io)?;
        Ok(Self {
            file,
            read_only: false,
        })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(DiskError::io)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl StorageBackend for FileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata().map_err(DiskError::io)?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("read-only backend"));
        }
        self.file.set_len(len).map_err(DiskError::io)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_offset(offset, buf.len())?;
        let file_len = self.len()?;
        if end > file_len {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: file_len,
            });
        }
        read_exact_at(&self.file, offset, buf).map_err(DiskError::io)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("read-only backend"));
        }
        end_offset(offset, buf.len())?;
        write_all_at(&self.file, offset, buf).map_err(DiskError::io)
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data().map_err(DiskError::io)
    }
}

/// Adapter exposing any `std::fs::File` as a backend without disturbing its
/// cursor (positioned I/O only).
#[derive(Debug)]
pub struct StdFileBackend {
    file: File,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata().map_err(DiskError::io)?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(DiskError::io)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_offset(offset, buf.len())?;
        let file_len = self.len()?;
        if end > file_len {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: file_len,
            });
        }
        read_exact_at(&self.file, offset, buf).map_err(DiskError::io)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        end_offset(offset, buf.len())?;
        write_all_at(&self.file, offset, buf).map_err(DiskError::io)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().map_err(DiskError::io)
    }
}
