//! The capability interface the worker holds its open disks behind, and the
//! adapters binding each concrete backend to it.
//!
//! Local images and local copy-on-write compositions run synchronous I/O;
//! the remote disks suspend on HTTP. `RemoteOverlayDisk` is the asynchronous
//! twin of `AeroCowDisk`: a writable sparse overlay over a read-only remote
//! base, with read-modify-write faulting at overlay block granularity.

use async_trait::async_trait;

use aero_storage::{
    AeroCowDisk, AeroSparseDisk, ChunkedStreamingDisk, DiskImage, FileBackend, StreamingDisk,
    StreamingTelemetry, VirtualDisk,
};

use crate::protocol::{ErrorKind, WorkerError};

/// Capability set of an open disk entry.
#[async_trait]
pub trait RuntimeDisk: Send + Sync {
    fn capacity_bytes(&self) -> u64;

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), WorkerError>;

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WorkerError>;

    async fn flush(&mut self) -> Result<(), WorkerError>;

    /// Idempotent. Flushes, then releases the backing resources; subsequent
    /// operations fail `Closed`.
    async fn close(&mut self) -> Result<(), WorkerError>;

    fn remote_telemetry(&self) -> Option<StreamingTelemetry> {
        None
    }

    /// Clears the disk's cache if it has one; `false` means the capability is
    /// absent.
    async fn clear_cache(&mut self) -> Result<bool, WorkerError> {
        Ok(false)
    }
}

fn closed_error() -> WorkerError {
    WorkerError::new(ErrorKind::Closed, "disk is closed")
}

/// A local disk image, optionally wrapped in a copy-on-write overlay.
pub enum LocalDisk {
    Plain(DiskImage<FileBackend>),
    Cow(AeroCowDisk<DiskImage<FileBackend>, FileBackend>),
}

pub struct LocalRuntimeDisk {
    disk: LocalDisk,
    closed: bool,
}

impl LocalRuntimeDisk {
    pub fn new(disk: LocalDisk) -> Self {
        Self {
            disk,
            closed: false,
        }
    }

    fn disk_mut(&mut self) -> Result<&mut dyn VirtualDisk, WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        Ok(match &mut self.disk {
            LocalDisk::Plain(disk) => disk as &mut dyn VirtualDisk,
            LocalDisk::Cow(disk) => disk,
        })
    }
}

#[async_trait]
impl RuntimeDisk for LocalRuntimeDisk {
    fn capacity_bytes(&self) -> u64 {
        match &self.disk {
            LocalDisk::Plain(disk) => disk.capacity_bytes(),
            LocalDisk::Cow(disk) => disk.capacity_bytes(),
        }
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), WorkerError> {
        Ok(self.disk_mut()?.read_at(offset, buf)?)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WorkerError> {
        Ok(self.disk_mut()?.write_at(offset, data)?)
    }

    async fn flush(&mut self) -> Result<(), WorkerError> {
        Ok(self.disk_mut()?.flush()?)
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        let result = self.disk_mut()?.flush();
        self.closed = true;
        Ok(result?)
    }
}

/// A remote read-only base of either delivery flavor.
pub enum RemoteBase {
    Range(StreamingDisk),
    Chunked(ChunkedStreamingDisk),
}

impl RemoteBase {
    pub fn capacity_bytes(&self) -> u64 {
        match self {
            RemoteBase::Range(disk) => disk.total_size(),
            RemoteBase::Chunked(disk) => disk.capacity_bytes(),
        }
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), WorkerError> {
        match self {
            RemoteBase::Range(disk) => Ok(disk.read_at(offset, buf).await?),
            RemoteBase::Chunked(disk) => Ok(disk.read_at(offset, buf).await?),
        }
    }

    async fn flush(&self) -> Result<(), WorkerError> {
        match self {
            RemoteBase::Range(disk) => Ok(disk.flush().await?),
            RemoteBase::Chunked(disk) => Ok(disk.flush().await?),
        }
    }

    async fn close(&self) -> Result<(), WorkerError> {
        match self {
            RemoteBase::Range(disk) => Ok(disk.close().await?),
            RemoteBase::Chunked(disk) => Ok(disk.close().await?),
        }
    }

    async fn clear_cache(&self) -> Result<(), WorkerError> {
        match self {
            RemoteBase::Range(disk) => Ok(disk.clear_cache().await?),
            RemoteBase::Chunked(disk) => Ok(disk.clear_cache().await?),
        }
    }

    fn telemetry(&self) -> StreamingTelemetry {
        match self {
            RemoteBase::Range(disk) => disk.telemetry_snapshot(),
            RemoteBase::Chunked(disk) => disk.telemetry_snapshot(),
        }
    }
}

/// A read-only remote disk handle.
pub struct RemoteRuntimeDisk {
    base: RemoteBase,
    closed: bool,
}

impl RemoteRuntimeDisk {
    pub fn new(base: RemoteBase) -> Self {
        Self {
            base,
            closed: false,
        }
    }
}

#[async_trait]
impl RuntimeDisk for RemoteRuntimeDisk {
    fn capacity_bytes(&self) -> u64 {
        self.base.capacity_bytes()
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        self.base.read_at(offset, buf).await
    }

    async fn write_at(&mut self, _offset: u64, _data: &[u8]) -> Result<(), WorkerError> {
        Err(WorkerError::new(
            ErrorKind::ReadOnly,
            "remote disk is read-only; open it with an overlay to write",
        ))
    }

    async fn flush(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        self.base.flush().await
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.base.close().await
    }

    fn remote_telemetry(&self) -> Option<StreamingTelemetry> {
        Some(self.base.telemetry())
    }

    async fn clear_cache(&mut self) -> Result<bool, WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        self.base.clear_cache().await?;
        Ok(true)
    }
}

/// Writable composition of a remote base and a local sparse overlay.
///
/// The same routing rules as `AeroCowDisk`, with the base reads suspending on
/// the network: allocated overlay blocks win, partial writes fault the block
/// from the base first, the base is never written.
pub struct RemoteOverlayDisk {
    base: RemoteBase,
    overlay: AeroSparseDisk<FileBackend>,
    capacity: u64,
    closed: bool,
}

impl RemoteOverlayDisk {
    pub fn new(base: RemoteBase, overlay: AeroSparseDisk<FileBackend>) -> Result<Self, WorkerError> {
        let capacity = base.capacity_bytes();
        if overlay.capacity_bytes() < capacity {
            return Err(WorkerError::new(
                ErrorKind::SizeMismatch,
                format!(
                    "overlay holds {} bytes but the base image is {capacity}",
                    overlay.capacity_bytes()
                ),
            ));
        }
        Ok(Self {
            base,
            overlay,
            capacity,
            closed: false,
        })
    }

    async fn read_base_block(&mut self, block: u64) -> Result<Vec<u8>, WorkerError> {
        let block_size = self.overlay.block_size_bytes() as u64;
        let start = block * block_size;
        let mut data = vec![0u8; block_size as usize];
        let in_base = (self.capacity.saturating_sub(start)).min(block_size) as usize;
        if in_base > 0 {
            self.base.read_at(start, &mut data[..in_base]).await?;
        }
        Ok(data)
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| WorkerError::new(ErrorKind::Overflow, "byte offset overflows u64"))?;
        if end > self.capacity {
            return Err(WorkerError::new(
                ErrorKind::OutOfRange,
                format!(
                    "access at {offset}+{len} exceeds capacity {}",
                    self.capacity
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeDisk for RemoteOverlayDisk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    async fn read_at(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<(), WorkerError> {
        self.check_bounds(offset, buf.len())?;
        let block_size = self.overlay.block_size_bytes() as u64;

        let mut filled = 0usize;
        while filled < buf.len() {
            let block = offset / block_size;
            let within = offset % block_size;
            let n = ((block_size - within) as usize).min(buf.len() - filled);
            let dst = &mut buf[filled..filled + n];
            if self.overlay.is_block_allocated(block) {
                self.overlay.read_at(offset, dst)?;
            } else {
                self.base.read_at(offset, dst).await?;
            }
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }

    async fn write_at(&mut self, mut offset: u64, data: &[u8]) -> Result<(), WorkerError> {
        self.check_bounds(offset, data.len())?;
        let block_size = self.overlay.block_size_bytes() as u64;

        let mut written = 0usize;
        while written < data.len() {
            let block = offset / block_size;
            let within = offset % block_size;
            let n = ((block_size - within) as usize).min(data.len() - written);
            let src = &data[written..written + n];

            if self.overlay.is_block_allocated(block) {
                self.overlay.write_at(offset, src)?;
            } else if within == 0 && n as u64 == block_size {
                self.overlay.write_block(block, src)?;
            } else {
                let mut merged = self.read_base_block(block).await?;
                merged[within as usize..within as usize + n].copy_from_slice(src);
                self.overlay.write_block(block, &merged)?;
            }

            written += n;
            offset += n as u64;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        self.overlay.flush()?;
        self.base.flush().await
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.overlay.flush()?;
        self.base.close().await
    }

    fn remote_telemetry(&self) -> Option<StreamingTelemetry> {
        Some(self.base.telemetry())
    }

    async fn clear_cache(&mut self) -> Result<bool, WorkerError> {
        if self.closed {
            return Err(closed_error());
        }
        self.base.clear_cache().await?;
        Ok(true)
    }
}
