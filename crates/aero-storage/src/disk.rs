use crate::backend::StorageBackend;
use crate::error::{DiskError, Result};
use crate::sparse::{AeroSparseDisk, AEROSPAR_MAGIC, SPARSE_HEADER_SIZE};

/// Fixed sector size exposed to guests. All sector-level I/O is validated
/// against this granularity.
pub const SECTOR_SIZE: usize = 512;

pub const DEFAULT_SECTOR_SIZE: usize = SECTOR_SIZE;

/// Uniform read/write/flush contract over a fixed byte capacity.
///
/// Implementations provide the byte-granular primitives; the sector-level
/// helpers validate 512-byte length alignment and capacity bounds before
/// delegating. Offset arithmetic is performed in `u64` with explicit overflow
/// checks.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let offset = sector_io_offset(self.capacity_bytes(), lba, buf.len())?;
        self.read_at(offset, buf)
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let offset = sector_io_offset(self.capacity_bytes(), lba, buf.len())?;
        self.write_at(offset, buf)
    }
}

/// Validates a sector-level request and returns its byte offset.
pub fn sector_io_offset(capacity: u64, lba: u64, len: usize) -> Result<u64> {
    let offset = lba
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if len % SECTOR_SIZE != 0 {
        return Err(DiskError::UnalignedAccess { offset, len });
    }
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(offset)
}

pub(crate) fn check_io_bounds(capacity: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// A disk whose bytes map 1:1 onto the backend.
#[derive(Debug)]
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Ok(Self { backend, capacity })
    }

    pub fn open(mut backend: B) -> Result<Self> {
        let capacity = backend.len()?;
        Ok(Self { backend, capacity })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_io_bounds(self.capacity, offset, buf.len())?;
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_io_bounds(self.capacity, offset, buf.len())?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

/// Disk wrapper that rejects writes with `NotSupported("read-only")`.
#[derive(Debug)]
pub struct ReadOnlyDisk<D> {
    inner: D,
}

impl<D: VirtualDisk> ReadOnlyDisk<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: VirtualDisk> VirtualDisk for ReadOnlyDisk<D> {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::NotSupported("read-only"))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    AeroSparse,
}

/// Best-effort format sniffing.
///
/// Detection is deliberately laxer than open-time validation: a file carrying
/// the aero-sparse magic with a plausible version is reported as `AeroSparse`
/// even when the rest of the header is invalid, so `open` can surface a
/// structured corruption error instead of silently treating the file as raw.
pub fn detect_format<B: StorageBackend>(backend: &mut B) -> Result<DiskFormat> {
    let len = backend.len()?;
    if len < AEROSPAR_MAGIC.len() as u64 {
        return Ok(DiskFormat::Raw);
    }

    let mut magic = [0u8; 8];
    backend.read_at(0, &mut magic)?;
    if magic != *AEROSPAR_MAGIC {
        return Ok(DiskFormat::Raw);
    }

    // Truncated header: still aero-sparse so the caller gets a useful error.
    if len < SPARSE_HEADER_SIZE {
        return Ok(DiskFormat::AeroSparse);
    }

    let mut version = [0u8; 4];
    backend.read_at(8, &mut version)?;
    if u32::from_le_bytes(version) == 1 {
        Ok(DiskFormat::AeroSparse)
    } else {
        Ok(DiskFormat::Raw)
    }
}

/// A disk image of any supported format behind one concrete type.
#[derive(Debug)]
pub enum DiskImage<B> {
    Raw(RawDisk<B>),
    AeroSparse(AeroSparseDisk<B>),
}

impl<B: StorageBackend> DiskImage<B> {
    pub fn open_auto(mut backend: B) -> Result<Self> {
        let format = detect_format(&mut backend)?;
        Self::open_with_format(format, backend)
    }

    pub fn open_with_format(format: DiskFormat, backend: B) -> Result<Self> {
        match format {
            DiskFormat::Raw => Ok(DiskImage::Raw(RawDisk::open(backend)?)),
            DiskFormat::AeroSparse => Ok(DiskImage::AeroSparse(AeroSparseDisk::open(backend)?)),
        }
    }

    pub fn format(&self) -> DiskFormat {
        match self {
            DiskImage::Raw(_) => DiskFormat::Raw,
            DiskImage::AeroSparse(_) => DiskFormat::AeroSparse,
        }
    }

    pub fn into_backend(self) -> B {
        match self {
            DiskImage::Raw(disk) => disk.into_backend(),
            DiskImage::AeroSparse(disk) => disk.into_backend(),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for DiskImage<B> {
    fn capacity_bytes(&self) -> u64 {
        match self {
            DiskImage::Raw(disk) => disk.capacity_bytes(),
            DiskImage::AeroSparse(disk) => disk.capacity_bytes(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            DiskImage::Raw(disk) => disk.read_at(offset, buf),
            DiskImage::AeroSparse(disk) => disk.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            DiskImage::Raw(disk) => disk.write_at(offset, buf),
            DiskImage::AeroSparse(disk) => disk.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            DiskImage::Raw(disk) => disk.flush(),
            DiskImage::AeroSparse(disk) => disk.flush(),
        }
    }
}
