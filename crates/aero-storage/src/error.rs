use thiserror::Error;

/// Error type shared by storage backends and virtual disks.
///
/// Invariant violations carry `&'static str` detail messages so corruption
/// reports stay allocation-free and matchable in tests.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("access out of bounds: offset {offset} len {len} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("unaligned access: offset {offset} len {len} (sector size 512)")]
    UnalignedAccess { offset: u64, len: usize },

    #[error("byte offset overflows u64")]
    OffsetOverflow,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("disk is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("unsupported image: {0}")]
    Unsupported(&'static str),

    #[error("corrupt image: {0}")]
    CorruptImage(&'static str),

    #[error("invalid sparse header: {0}")]
    InvalidSparseHeader(&'static str),

    #[error("corrupt sparse image: {0}")]
    CorruptSparseImage(&'static str),

    #[error("capacity mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch { expected: u64, found: u64 },

    #[error("i/o error: {0}")]
    Io(String),
}

impl DiskError {
    pub(crate) fn io(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, DiskError>;
