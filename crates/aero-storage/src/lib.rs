//! Virtual-disk runtime storage core.
//!
//! Uniform sector-addressed disks over pluggable byte backends:
//!
//! - [`AeroSparseDisk`]: the aero-sparse fixed-block image format, used for
//!   local disks and as the on-disk cache of the remote disks.
//! - [`AeroCowDisk`]: copy-on-write composition of a read-only base and a
//!   writable sparse overlay.
//! - [`StreamingDisk`] / [`ChunkedStreamingDisk`] (non-wasm): HTTP-backed
//!   read-only disks with a persistent, validator-checked chunk cache.

mod backend;
mod block_cache;
mod cow;
mod disk;
mod error;
mod sparse;

#[cfg(not(target_arch = "wasm32"))]
mod file_backend;
#[cfg(not(target_arch = "wasm32"))]
mod streaming;

pub use backend::{MemBackend, ReadOnlyBackend, StorageBackend};
pub use block_cache::BlockCachedDisk;
pub use cow::AeroCowDisk;
pub use disk::{
    detect_format, sector_io_offset, DiskFormat, DiskImage, RawDisk, ReadOnlyDisk, VirtualDisk,
    DEFAULT_SECTOR_SIZE, SECTOR_SIZE,
};
pub use error::{DiskError, Result};
pub use sparse::{
    AeroSparseConfig, AeroSparseDisk, AeroSparseHeader, AEROSPAR_MAGIC,
    MAX_ALLOCATION_TABLE_BYTES, SPARSE_HEADER_SIZE,
};

#[cfg(not(target_arch = "wasm32"))]
pub use file_backend::{FileBackend, StdFileBackend};
#[cfg(not(target_arch = "wasm32"))]
pub use streaming::{
    ChunkManifest, ChunkedDiskManifest, ChunkedStreamingDisk, ChunkedStreamingDiskConfig,
    ChunkedStreamingDiskError, ChunkedStreamingDiskSync, FetchLease, StaticLease,
    StreamingCacheBackend, StreamingDisk, StreamingDiskConfig, StreamingDiskError,
    StreamingDiskOptions, StreamingTelemetry,
};
