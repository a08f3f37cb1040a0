//! On-disk chunk stores backing the streaming disks.
//!
//! Two layouts share one directory scheme (`base.aerospar` + `meta.json`,
//! plus `chunks/` for the directory layout):
//!
//! - `SparseFile`: one aero-sparse image whose block `i` is chunk `i`. Tail
//!   chunks are zero-padded to the block size on write.
//! - `Directory`: one `chunks/{i}.bin` file per chunk, stored unpadded.

use std::path::{Path, PathBuf};

use crate::error::{DiskError, Result};
use crate::file_backend::FileBackend;
use crate::sparse::{align_up, AeroSparseConfig, AeroSparseDisk};
use crate::{StorageBackend, VirtualDisk};

use super::meta::CacheMetadata;

#[derive(Debug, Clone)]
pub(crate) struct CachePaths {
    pub root: PathBuf,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn base_image(&self) -> PathBuf {
        self.root.join("base.aerospar")
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    fn chunk_file(&self, chunk: u64) -> PathBuf {
        self.chunks_dir().join(format!("{chunk}.bin"))
    }

    /// Removes every cache artifact, leaving the root directory in place.
    pub fn wipe(&self) -> Result<()> {
        remove_file_if_present(&self.base_image())?;
        remove_file_if_present(&self.metadata())?;
        let chunks = self.chunks_dir();
        if chunks.is_dir() {
            std::fs::remove_dir_all(&chunks).map_err(DiskError::io)?;
        }
        Ok(())
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DiskError::io(err)),
    }
}

#[derive(Debug)]
pub(crate) enum ChunkStore {
    Sparse {
        image: AeroSparseDisk<FileBackend>,
        chunk_size: u64,
    },
    Directory { paths: CachePaths },
}

impl ChunkStore {
    pub fn create(
        backend: super::StreamingCacheBackend,
        paths: &CachePaths,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&paths.root).map_err(DiskError::io)?;
        match backend {
            super::StreamingCacheBackend::SparseFile => {
                let file = FileBackend::create(paths.base_image(), 0)?;
                let image = AeroSparseDisk::create(
                    file,
                    AeroSparseConfig {
                        disk_size_bytes: align_up(total_size, chunk_size),
                        block_size_bytes: chunk_size as u32,
                    },
                )?;
                Ok(ChunkStore::Sparse { image, chunk_size })
            }
            super::StreamingCacheBackend::Directory => {
                std::fs::create_dir_all(paths.chunks_dir()).map_err(DiskError::io)?;
                Ok(ChunkStore::Directory {
                    paths: paths.clone(),
                })
            }
        }
    }

    /// Re-opens an existing cache. Any inconsistency is an error; the caller
    /// responds by wiping and recreating.
    pub fn open(
        backend: super::StreamingCacheBackend,
        paths: &CachePaths,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        match backend {
            super::StreamingCacheBackend::SparseFile => {
                let file = FileBackend::open_rw(paths.base_image())?;
                let image = AeroSparseDisk::open(file)?;
                let expected = align_up(total_size, chunk_size);
                if image.capacity_bytes() != expected
                    || image.block_size_bytes() as u64 != chunk_size
                {
                    return Err(DiskError::SizeMismatch {
                        expected,
                        found: image.capacity_bytes(),
                    });
                }
                Ok(ChunkStore::Sparse { image, chunk_size })
            }
            super::StreamingCacheBackend::Directory => {
                if !paths.chunks_dir().is_dir() {
                    return Err(DiskError::Io("chunk directory missing".to_string()));
                }
                Ok(ChunkStore::Directory {
                    paths: paths.clone(),
                })
            }
        }
    }

    /// Whether chunk `chunk` is materialized. For the directory layout this
    /// consults the filesystem so externally deleted chunk files read as
    /// misses (healing).
    pub fn has_chunk(&self, chunk: u64, meta: &CacheMetadata) -> bool {
        match self {
            ChunkStore::Sparse { image, .. } => image.is_block_allocated(chunk),
            ChunkStore::Directory { paths, .. } => {
                meta.covers_chunk(chunk) && paths.chunk_file(chunk).is_file()
            }
        }
    }

    /// Reads `buf.len()` bytes starting `within` bytes into chunk `chunk`.
    /// Returns `Ok(false)` when the chunk is no longer materialized.
    pub fn read_chunk(&mut self, chunk: u64, within: u64, buf: &mut [u8]) -> Result<bool> {
        match self {
            ChunkStore::Sparse { image, chunk_size } => {
                if !image.is_block_allocated(chunk) {
                    return Ok(false);
                }
                image.read_at(chunk * *chunk_size + within, buf)?;
                Ok(true)
            }
            ChunkStore::Directory { paths, .. } => {
                let mut file = match FileBackend::open_read_only(paths.chunk_file(chunk)) {
                    Ok(file) => file,
                    Err(DiskError::Io(_)) => return Ok(false),
                    Err(err) => return Err(err),
                };
                file.read_at(within, buf)?;
                Ok(true)
            }
        }
    }

    /// Persists chunk `chunk`. `data` is the unpadded chunk body; the sparse
    /// layout pads the tail chunk with zeros to the block size.
    pub fn write_chunk(&mut self, chunk: u64, data: &[u8]) -> Result<()> {
        match self {
            ChunkStore::Sparse { image, chunk_size } => {
                if data.len() as u64 == *chunk_size {
                    image.write_block(chunk, data)
                } else {
                    let mut padded = vec![0u8; *chunk_size as usize];
                    padded[..data.len()].copy_from_slice(data);
                    image.write_block(chunk, &padded)
                }
            }
            ChunkStore::Directory { paths, .. } => {
                std::fs::create_dir_all(paths.chunks_dir()).map_err(DiskError::io)?;
                std::fs::write(paths.chunk_file(chunk), data).map_err(DiskError::io)
            }
        }
    }

    pub fn remove_chunk(&mut self, chunk: u64) -> Result<()> {
        match self {
            ChunkStore::Sparse { image, .. } => image.deallocate_block(chunk),
            ChunkStore::Directory { paths, .. } => remove_file_if_present(&paths.chunk_file(chunk)),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            ChunkStore::Sparse { image, .. } => image.flush(),
            ChunkStore::Directory { .. } => Ok(()),
        }
    }

    /// Whether every chunk the metadata claims as cached is actually
    /// materialized. A sparse store that disagrees with its metadata means the
    /// pair cannot be trusted.
    pub fn consistent_with(&self, meta: &CacheMetadata) -> bool {
        match self {
            ChunkStore::Sparse { image, chunk_size } => meta.cached_ranges.iter().all(|range| {
                let first = range.start / *chunk_size;
                let last = (range.end - 1) / *chunk_size;
                (first..=last).all(|chunk| image.is_block_allocated(chunk))
            }),
            // Directory chunks are checked lazily on access instead (healing).
            ChunkStore::Directory { .. } => true,
        }
    }
}
