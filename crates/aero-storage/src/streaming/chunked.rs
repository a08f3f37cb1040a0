//! Manifest-driven chunked streaming disk.
//!
//! The image is pre-split into `chunks/{index}.bin` objects described by an
//! `aero.chunked-disk-image.v1` JSON manifest carrying per-chunk SHA-256
//! digests. Every downloaded chunk is verified before it is cached; an
//! optional cache byte limit evicts least-recently-used chunks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::error::DiskError;

use super::engine::{ChunkEngine, EngineConfig};
use super::http::{redacted, HttpClient};
use super::meta::{CacheIdentity, CacheValidators};
use super::store::CachePaths;
use super::{
    check_read_span, fan_out_ensure, hex_digest, serve_cached_range, StreamingCacheBackend,
    StreamingDiskError, StreamingDiskOptions, StreamingTelemetry, MAX_CHUNK_SIZE,
};

const MANIFEST_SCHEMA: &str = "aero.chunked-disk-image.v1";
const MAX_MANIFEST_BYTES: u64 = 64 * 1024 * 1024;
const MAX_MANIFEST_CHUNKS: u64 = 1_000_000;
const MAX_CHUNK_INDEX_WIDTH: u32 = 20;

#[derive(Debug, Error)]
pub enum ChunkedStreamingDiskError {
    #[error("http transport error: {0}")]
    Http(String),

    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote validator mismatch (expected {expected:?}, got {actual:?})")]
    ValidatorMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("chunk {chunk_index} integrity mismatch (expected sha256 {expected}, got {actual})")]
    Integrity {
        chunk_index: u64,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("disk is closed")]
    Closed,
}

impl From<StreamingDiskError> for ChunkedStreamingDiskError {
    fn from(err: StreamingDiskError) -> Self {
        match err {
            StreamingDiskError::Http(msg) => Self::Http(msg),
            StreamingDiskError::HttpStatus { status, url } => Self::HttpStatus { status, url },
            StreamingDiskError::Protocol(msg) => Self::Protocol(msg),
            StreamingDiskError::RangeNotSupported => {
                Self::Protocol("server ignored the Range header".to_string())
            }
            StreamingDiskError::ValidatorMismatch { expected, actual } => {
                Self::ValidatorMismatch { expected, actual }
            }
            StreamingDiskError::Integrity {
                chunk_index,
                expected,
                actual,
            } => Self::Integrity {
                chunk_index,
                expected,
                actual,
            },
            StreamingDiskError::Disk(err) => Self::Disk(err),
            StreamingDiskError::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawManifestChunk {
    size: u64,
    sha256: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema: String,
    #[serde(default)]
    image_id: Option<String>,
    version: String,
    #[serde(default)]
    mime_type: Option<String>,
    total_size: u64,
    chunk_size: u64,
    chunk_count: u64,
    chunk_index_width: u32,
    #[serde(default)]
    chunks: Option<Vec<RawManifestChunk>>,
}

/// Validated chunked-disk manifest.
#[derive(Debug, Clone)]
pub struct ChunkedDiskManifest {
    pub image_id: Option<String>,
    pub version: String,
    pub mime_type: Option<String>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub chunk_index_width: u32,
    /// Lower-cased hex digests, one per chunk, when the manifest carries them.
    pub sha256: Option<Vec<String>>,
}

impl ChunkedDiskManifest {
    pub fn parse(raw: &[u8]) -> Result<Self, ChunkedStreamingDiskError> {
        let manifest: RawManifest = serde_json::from_slice(raw)
            .map_err(|err| ChunkedStreamingDiskError::Protocol(format!("bad manifest: {err}")))?;
        if manifest.schema != MANIFEST_SCHEMA {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "unknown manifest schema {:?}",
                manifest.schema
            )));
        }
        if manifest.chunk_size == 0
            || manifest.chunk_size % crate::SECTOR_SIZE as u64 != 0
            || manifest.chunk_size > MAX_CHUNK_SIZE
        {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "invalid chunkSize {}",
                manifest.chunk_size
            )));
        }
        if manifest.total_size == 0 || manifest.total_size % crate::SECTOR_SIZE as u64 != 0 {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "totalSize {} is not a positive multiple of 512",
                manifest.total_size
            )));
        }
        let expected_chunks = manifest.total_size.div_ceil(manifest.chunk_size);
        if manifest.chunk_count != expected_chunks {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "chunkCount {} does not match totalSize/chunkSize",
                manifest.chunk_count
            )));
        }
        if manifest.chunk_count > MAX_MANIFEST_CHUNKS {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "chunkCount {} exceeds the {MAX_MANIFEST_CHUNKS} entry limit",
                manifest.chunk_count
            )));
        }
        if manifest.chunk_index_width == 0 || manifest.chunk_index_width > MAX_CHUNK_INDEX_WIDTH {
            return Err(ChunkedStreamingDiskError::Protocol(format!(
                "chunkIndexWidth {} is too large (limit {MAX_CHUNK_INDEX_WIDTH})",
                manifest.chunk_index_width
            )));
        }

        let sha256 = match manifest.chunks {
            None => None,
            Some(chunks) => {
                if chunks.len() as u64 != manifest.chunk_count {
                    return Err(ChunkedStreamingDiskError::Protocol(
                        "chunks array length does not match chunkCount".to_string(),
                    ));
                }
                let mut digests = Vec::with_capacity(chunks.len());
                let mut seen_bytes = 0u64;
                for (index, chunk) in chunks.iter().enumerate() {
                    let is_last = index as u64 == manifest.chunk_count - 1;
                    if !is_last && chunk.size != manifest.chunk_size {
                        return Err(ChunkedStreamingDiskError::Protocol(format!(
                            "chunk {index} has size {} instead of chunkSize",
                            chunk.size
                        )));
                    }
                    if is_last && (chunk.size == 0 || chunk.size > manifest.chunk_size) {
                        return Err(ChunkedStreamingDiskError::Protocol(
                            "final chunk size out of range".to_string(),
                        ));
                    }
                    seen_bytes += chunk.size;
                    digests.push(normalize_digest(&chunk.sha256).ok_or_else(|| {
                        ChunkedStreamingDiskError::Protocol(format!(
                            "chunk {index} carries a malformed sha256 digest"
                        ))
                    })?);
                }
                if seen_bytes != manifest.total_size {
                    return Err(ChunkedStreamingDiskError::Protocol(
                        "chunk sizes do not sum to totalSize".to_string(),
                    ));
                }
                Some(digests)
            }
        };

        Ok(Self {
            image_id: manifest.image_id,
            version: manifest.version,
            mime_type: manifest.mime_type,
            total_size: manifest.total_size,
            chunk_size: manifest.chunk_size,
            chunk_count: manifest.chunk_count,
            chunk_index_width: manifest.chunk_index_width,
            sha256,
        })
    }

    fn chunk_url(&self, manifest_url: &Url, chunk: u64) -> Result<Url, ChunkedStreamingDiskError> {
        let width = self.chunk_index_width as usize;
        manifest_url
            .join(&format!("chunks/{chunk:0width$}.bin"))
            .map_err(|err| ChunkedStreamingDiskError::Protocol(format!("bad chunk url: {err}")))
    }
}

fn normalize_digest(raw: &str) -> Option<String> {
    let digest = raw.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest)
}

#[derive(Clone)]
pub struct ChunkedStreamingDiskConfig {
    /// Manifest URL; chunk URLs are resolved relative to it.
    pub url: Url,
    pub cache_dir: PathBuf,
    pub cache_backend: StreamingCacheBackend,
    pub image_id: Option<String>,
    pub request_headers: Vec<(String, String)>,
    /// Evict least-recently-used chunks to keep the cache under this size.
    pub cache_limit_bytes: Option<u64>,
    pub options: StreamingDiskOptions,
}

impl ChunkedStreamingDiskConfig {
    pub fn new(url: Url, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            url,
            cache_dir: cache_dir.into(),
            cache_backend: StreamingCacheBackend::default(),
            image_id: None,
            request_headers: Vec::new(),
            cache_limit_bytes: None,
            options: StreamingDiskOptions::default(),
        }
    }
}

impl std::fmt::Debug for ChunkedStreamingDiskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedStreamingDiskConfig")
            .field("url", &redacted(&self.url))
            .field("cache_dir", &self.cache_dir)
            .field("cache_backend", &self.cache_backend)
            .field("image_id", &self.image_id)
            .field("cache_limit_bytes", &self.cache_limit_bytes)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct ChunkedInner {
    engine: Arc<ChunkEngine>,
    http: HttpClient,
    manifest_url: Url,
    manifest: ChunkedDiskManifest,
    read_ahead_chunks: usize,
    last_read_end: AtomicU64,
}

/// Read-only disk over a chunk-object image with per-chunk SHA-256
/// verification and optional LRU cache eviction.
#[derive(Clone)]
pub struct ChunkedStreamingDisk {
    inner: Arc<ChunkedInner>,
}

impl std::fmt::Debug for ChunkedStreamingDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedStreamingDisk").finish()
    }
}

impl ChunkedStreamingDisk {
    pub async fn open(
        config: ChunkedStreamingDiskConfig,
    ) -> Result<Self, ChunkedStreamingDiskError> {
        // chunk_size comes from the manifest; validate the rest up front.
        let mut options = config.options.clone();
        options.chunk_size = crate::SECTOR_SIZE as u64;
        options.validate()?;

        let http = HttpClient::new(config.request_headers.clone());
        let response = http.get(&config.url, MAX_MANIFEST_BYTES).await?;
        if !response.head.status.is_success() {
            return Err(ChunkedStreamingDiskError::HttpStatus {
                status: response.head.status.as_u16(),
                url: redacted(&config.url),
            });
        }
        let manifest = ChunkedDiskManifest::parse(&response.body)?;
        options.chunk_size = manifest.chunk_size;
        options.validate()?;
        options.validate_for_size(manifest.total_size)?;

        if let Some(limit) = config.cache_limit_bytes {
            if limit < manifest.chunk_size {
                return Err(ChunkedStreamingDiskError::Protocol(
                    "cache limit is smaller than one chunk".to_string(),
                ));
            }
        }

        let image_id = config
            .image_id
            .clone()
            .or_else(|| manifest.image_id.clone())
            .unwrap_or_else(|| "chunked-image".to_string());
        let identity = CacheIdentity {
            image_id,
            image_version: manifest.version.clone(),
            delivery_type: "chunked",
            cache_backend: config.cache_backend.as_str(),
            chunk_size_bytes: manifest.chunk_size,
        };
        let validators = CacheValidators {
            size_bytes: manifest.total_size,
            etag: None,
            last_modified: None,
        };

        let engine = Arc::new(ChunkEngine::open(EngineConfig {
            identity,
            cache_backend: config.cache_backend,
            paths: CachePaths::new(&config.cache_dir),
            total_size: manifest.total_size,
            chunk_size: manifest.chunk_size,
            validators,
            max_concurrent_fetches: options.max_concurrent_fetches,
            max_retries: options.max_retries,
            retry_base_delay_ms: options.retry_base_delay_ms,
            cache_limit_bytes: config.cache_limit_bytes,
        })?);

        Ok(Self {
            inner: Arc::new(ChunkedInner {
                engine,
                http,
                manifest_url: config.url.clone(),
                manifest,
                read_ahead_chunks: options.read_ahead_chunks,
                last_read_end: AtomicU64::new(u64::MAX),
            }),
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.engine.total_size()
    }

    pub fn manifest(&self) -> &ChunkedDiskManifest {
        &self.inner.manifest
    }

    pub fn telemetry_snapshot(&self) -> StreamingTelemetry {
        self.inner.engine.telemetry_snapshot()
    }

    pub async fn read_at(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), ChunkedStreamingDiskError> {
        let Some((first, last)) = check_read_span(&self.inner.engine, offset, buf.len())? else {
            return Ok(());
        };
        fan_out_ensure(self, first..=last, |disk, chunk| async move {
            disk.ensure_chunk(chunk).await
        })
        .await?;
        serve_cached_range(&self.inner.engine, offset, buf, &|chunk| {
            self.ensure_chunk(chunk)
        })
        .await?;

        let sequential = self.inner.last_read_end.load(Ordering::Relaxed) == offset;
        let end = offset + buf.len() as u64;
        self.inner.last_read_end.store(end, Ordering::Relaxed);
        if sequential && self.inner.read_ahead_chunks > 0 {
            let limit = self.inner.engine.chunk_count();
            let next = last + 1;
            for chunk in next..(next + self.inner.read_ahead_chunks as u64).min(limit) {
                let disk = self.clone();
                tokio::spawn(async move {
                    let _ = disk.ensure_chunk(chunk).await;
                });
            }
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), ChunkedStreamingDiskError> {
        Ok(self.inner.engine.flush().await?)
    }

    pub async fn clear_cache(&self) -> Result<(), ChunkedStreamingDiskError> {
        Ok(self.inner.engine.clear_cache().await?)
    }

    pub async fn close(&self) -> Result<(), ChunkedStreamingDiskError> {
        Ok(self.inner.engine.close().await?)
    }

    async fn ensure_chunk(&self, chunk: u64) -> Result<(), StreamingDiskError> {
        ChunkEngine::ensure_chunk_cached(&self.inner.engine, chunk, &|chunk| {
            self.fetch_chunk(chunk)
        })
        .await
    }

    /// One download of one chunk object, digest-checked before it is handed
    /// to the cache.
    async fn fetch_chunk(&self, chunk: u64) -> Result<Bytes, StreamingDiskError> {
        let url = self
            .inner
            .manifest
            .chunk_url(&self.inner.manifest_url, chunk)
            .map_err(|err| StreamingDiskError::Protocol(err.to_string()))?;

        self.inner.engine.record_range_request();
        let response = self
            .inner
            .http
            .get(&url, self.inner.manifest.chunk_size)
            .await?;
        if !response.head.status.is_success() {
            return Err(StreamingDiskError::HttpStatus {
                status: response.head.status.as_u16(),
                url: redacted(&url),
            });
        }
        self.inner.engine.record_download(response.body.len() as u64);

        if let Some(digests) = &self.inner.manifest.sha256 {
            use sha2::{Digest, Sha256};
            let expected = digests.get(chunk as usize).ok_or_else(|| {
                StreamingDiskError::Protocol(format!("no manifest digest for chunk {chunk}"))
            })?;
            let actual: [u8; 32] = Sha256::digest(&response.body).into();
            let actual = hex_digest(&actual);
            if actual != *expected {
                return Err(StreamingDiskError::Integrity {
                    chunk_index: chunk,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(response.body)
    }
}

/// Blocking facade over [`ChunkedStreamingDisk`] for callers without an async
/// runtime; owns a current-thread runtime internally.
pub struct ChunkedStreamingDiskSync {
    runtime: tokio::runtime::Runtime,
    disk: ChunkedStreamingDisk,
}

impl ChunkedStreamingDiskSync {
    pub fn open(config: ChunkedStreamingDiskConfig) -> Result<Self, ChunkedStreamingDiskError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ChunkedStreamingDiskError::Http(err.to_string()))?;
        let disk = runtime.block_on(ChunkedStreamingDisk::open(config))?;
        Ok(Self { runtime, disk })
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.disk.capacity_bytes()
    }

    pub fn telemetry_snapshot(&self) -> StreamingTelemetry {
        self.disk.telemetry_snapshot()
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ChunkedStreamingDiskError> {
        self.runtime.block_on(self.disk.read_at(offset, buf))
    }

    pub fn flush(&mut self) -> Result<(), ChunkedStreamingDiskError> {
        self.runtime.block_on(self.disk.flush())
    }

    pub fn close(&mut self) -> Result<(), ChunkedStreamingDiskError> {
        self.runtime.block_on(self.disk.close())
    }
}
