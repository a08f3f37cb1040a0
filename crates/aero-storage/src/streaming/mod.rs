//! HTTP-backed read-only disks with a persistent local chunk cache.
//!
//! [`StreamingDisk`] streams an image served as one large file via HTTP byte
//! ranges; [`ChunkedStreamingDisk`] streams a pre-chunked image described by a
//! JSON manifest with per-chunk SHA-256 digests. Both cache downloaded chunks
//! on disk (aero-sparse image or one file per chunk) keyed by a stable image
//! identity, never by URL.

mod chunked;
mod engine;
mod http;
mod meta;
mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use url::Url;

use crate::error::DiskError;

use engine::{ChunkEngine, EngineConfig};
use http::{parse_content_range, redacted, HttpClient, ResponseHead};
use meta::{CacheIdentity, CacheValidators};
use store::CachePaths;

pub use chunked::{
    ChunkedDiskManifest, ChunkedStreamingDisk, ChunkedStreamingDiskConfig,
    ChunkedStreamingDiskError, ChunkedStreamingDiskSync,
};

/// Upper bound on a single chunk, and with it on any single range request.
pub(crate) const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

const MAX_RETRIES_LIMIT: u32 = 32;
const MAX_CONCURRENT_FETCHES_LIMIT: usize = 128;
const MAX_READ_AHEAD_CHUNKS: usize = 1024;
/// Cap on bytes that may be in flight (or queued by read-ahead) at once.
const MAX_INFLIGHT_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StreamingDiskError {
    #[error("http transport error: {0}")]
    Http(String),

    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server ignored the Range header")]
    RangeNotSupported,

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

/// Where downloaded chunks are materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingCacheBackend {
    /// One aero-sparse image (`base.aerospar`); chunk `i` is block `i`.
    #[default]
    SparseFile,
    /// One `chunks/{i}.bin` file per chunk.
    Directory,
}

impl StreamingCacheBackend {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            StreamingCacheBackend::SparseFile => "sparseFile",
            StreamingCacheBackend::Directory => "directory",
        }
    }
}

/// Optional per-chunk SHA-256 digests for a range-served image.
#[derive(Debug, Clone)]
pub struct ChunkManifest {
    pub chunk_size: u64,
    pub sha256: Vec<[u8; 32]>,
}

/// Rotating-URL provider (e.g. signed URLs). Every request asks for the
/// current URL; a 401/403 response triggers exactly one refresh-and-retry.
#[async_trait::async_trait]
pub trait FetchLease: Send + Sync {
    fn current_url(&self) -> Url;

    async fn refresh_url(&self) -> Result<Url, String>;
}

/// Lease over a URL that never rotates.
#[derive(Debug, Clone)]
pub struct StaticLease {
    url: Url,
}

impl StaticLease {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait::async_trait]
impl FetchLease for StaticLease {
    fn current_url(&self) -> Url {
        self.url.clone()
    }

    async fn refresh_url(&self) -> Result<Url, String> {
        Ok(self.url.clone())
    }
}

#[derive(Debug, Clone)]
pub struct StreamingDiskOptions {
    /// Power-of-two multiple of 512, at most 64 MiB.
    pub chunk_size: u64,
    pub max_concurrent_fetches: usize,
    /// Total fetch attempts per chunk (first try included), 1..=32.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub read_ahead_chunks: usize,
    pub manifest: Option<ChunkManifest>,
}

impl Default for StreamingDiskOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_concurrent_fetches: 4,
            max_retries: 4,
            retry_base_delay_ms: 50,
            read_ahead_chunks: 2,
            manifest: None,
        }
    }
}

impl StreamingDiskOptions {
    /// Static bounds, checked before the first request goes out.
    fn validate(&self) -> Result<(), StreamingDiskError> {
        if self.chunk_size == 0
            || self.chunk_size % crate::SECTOR_SIZE as u64 != 0
            || !self.chunk_size.is_power_of_two()
        {
            return Err(StreamingDiskError::Protocol(
                "chunk_size must be a power-of-two multiple of 512".to_string(),
            ));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(StreamingDiskError::Protocol(format!(
                "chunk_size {} exceeds the {MAX_CHUNK_SIZE} byte limit",
                self.chunk_size
            )));
        }
        if self.max_retries == 0 || self.max_retries > MAX_RETRIES_LIMIT {
            return Err(StreamingDiskError::Protocol(format!(
                "max_retries must be within 1..={MAX_RETRIES_LIMIT}"
            )));
        }
        if self.max_concurrent_fetches == 0
            || self.max_concurrent_fetches > MAX_CONCURRENT_FETCHES_LIMIT
        {
            return Err(StreamingDiskError::Protocol(format!(
                "max_concurrent_fetches must be within 1..={MAX_CONCURRENT_FETCHES_LIMIT}"
            )));
        }
        if self.read_ahead_chunks > MAX_READ_AHEAD_CHUNKS {
            return Err(StreamingDiskError::Protocol(format!(
                "read_ahead_chunks must be at most {MAX_READ_AHEAD_CHUNKS}"
            )));
        }
        if (self.read_ahead_chunks as u64).saturating_mul(self.chunk_size) > MAX_INFLIGHT_BYTES {
            return Err(StreamingDiskError::Protocol(
                "read_ahead_chunks * chunk_size exceeds the inflight byte cap".to_string(),
            ));
        }
        Ok(())
    }

    /// Bounds that depend on the probed image size.
    fn validate_for_size(&self, total_size: u64) -> Result<(), StreamingDiskError> {
        let per_fetch = self.chunk_size.min(total_size.max(1));
        if (self.max_concurrent_fetches as u64).saturating_mul(per_fetch) > MAX_INFLIGHT_BYTES {
            return Err(StreamingDiskError::Protocol(
                "max_concurrent_fetches * chunk_size exceeds the inflight byte cap".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct StreamingDiskConfig {
    pub url: Url,
    /// Root directory of this disk's cache (`base.aerospar`, `meta.json`,
    /// `chunks/` live directly inside it).
    pub cache_dir: PathBuf,
    pub cache_backend: StreamingCacheBackend,
    /// Stable cache identity. URLs never participate; two configs with the
    /// same identity share a cache even when their (signed) URLs differ.
    pub image_id: Option<String>,
    pub image_version: Option<String>,
    /// Extra headers attached to every HTTP request.
    pub request_headers: Vec<(String, String)>,
    /// Expected validator; open fails `ValidatorMismatch` when the remote
    /// reports a different one.
    pub validator: Option<String>,
    pub lease: Option<Arc<dyn FetchLease>>,
    pub options: StreamingDiskOptions,
}

impl StreamingDiskConfig {
    pub fn new(url: Url, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            url,
            cache_dir: cache_dir.into(),
            cache_backend: StreamingCacheBackend::default(),
            image_id: None,
            image_version: None,
            request_headers: Vec::new(),
            validator: None,
            lease: None,
            options: StreamingDiskOptions::default(),
        }
    }
}

impl std::fmt::Debug for StreamingDiskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDiskConfig")
            .field("url", &redacted(&self.url))
            .field("cache_dir", &self.cache_dir)
            .field("cache_backend", &self.cache_backend)
            .field("image_id", &self.image_id)
            .field("image_version", &self.image_version)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a streaming disk's counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingTelemetry {
    pub total_size: u64,
    /// Cache block size; equals the transfer chunk size.
    pub block_size: u64,
    /// Unpadded bytes currently materialized in the cache.
    pub cached_bytes: u64,
    pub block_requests: u64,
    pub cache_hit_chunks: u64,
    pub cache_miss_chunks: u64,
    pub inflight_joins: u64,
    /// HTTP requests issued for image bytes.
    pub range_requests: u64,
    pub bytes_downloaded: u64,
    pub inflight_fetches: u64,
    pub last_fetch_ms: Option<u64>,
    pub last_fetch_at_ms: Option<u64>,
    pub last_fetch_range: Option<(u64, u64)>,
}

/// Outcome of probing the remote image.
#[derive(Debug, Clone)]
struct RemoteProbe {
    size: u64,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl RemoteProbe {
    /// The validator used for `If-Range` and cache identity: ETag when
    /// exposed, Last-Modified otherwise.
    fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

fn is_weak_etag(validator: &str) -> bool {
    validator.trim_start().starts_with("W/")
}

struct RangeInner {
    engine: Arc<ChunkEngine>,
    http: HttpClient,
    url: std::sync::Mutex<Url>,
    lease: Option<Arc<dyn FetchLease>>,
    probe: RemoteProbe,
    /// `If-Range` value sent with every range request; `None` for weak ETags
    /// (RFC 9110 forbids weak validators in `If-Range`).
    if_range: Option<String>,
    read_ahead_chunks: usize,
    manifest: Option<ChunkManifest>,
    /// End offset of the previous read, for sequential prefetch detection.
    last_read_end: AtomicU64,
}

/// Read-only disk streaming an HTTP-served image through a validator-checked
/// persistent chunk cache.
///
/// Cloning is cheap and clones observe the same cache and telemetry.
#[derive(Clone)]
pub struct StreamingDisk {
    inner: Arc<RangeInner>,
}

impl std::fmt::Debug for StreamingDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDisk").finish()
    }
}

impl StreamingDisk {
    pub async fn open(config: StreamingDiskConfig) -> Result<Self, StreamingDiskError> {
        config.options.validate()?;
        if let Some(manifest) = &config.options.manifest {
            if manifest.chunk_size != config.options.chunk_size {
                return Err(StreamingDiskError::Protocol(
                    "manifest chunk size differs from configured chunk size".to_string(),
                ));
            }
        }

        let http = HttpClient::new(config.request_headers.clone());
        let mut url = match &config.lease {
            Some(lease) => lease.current_url(),
            None => config.url.clone(),
        };

        let probe = match probe_remote(&http, &url).await {
            Ok(probe) => probe,
            Err(StreamingDiskError::HttpStatus { status, url: failed_url })
                if status == 401 || status == 403 =>
            {
                let Some(lease) = config.lease.as_ref() else {
                    return Err(StreamingDiskError::HttpStatus {
                        status,
                        url: failed_url,
                    });
                };
                url = lease.refresh_url().await.map_err(StreamingDiskError::Http)?;
                probe_remote(&http, &url).await?
            }
            Err(err) => return Err(err),
        };

        config.options.validate_for_size(probe.size)?;

        if let Some(expected) = &config.validator {
            let actual = probe.validator();
            if actual != Some(expected.as_str()) {
                return Err(StreamingDiskError::ValidatorMismatch {
                    expected: Some(expected.clone()),
                    actual: actual.map(|v| v.to_string()),
                });
            }
        }

        if let Some(manifest) = &config.options.manifest {
            let expected_chunks = probe.size.div_ceil(manifest.chunk_size);
            if manifest.sha256.len() as u64 != expected_chunks {
                return Err(StreamingDiskError::Protocol(
                    "manifest digest count does not match the image size".to_string(),
                ));
            }
        }

        let identity = CacheIdentity {
            image_id: config.image_id.clone().unwrap_or_else(|| "image".to_string()),
            image_version: config.image_version.clone().unwrap_or_else(|| "0".to_string()),
            delivery_type: "range",
            cache_backend: config.cache_backend.as_str(),
            chunk_size_bytes: config.options.chunk_size,
        };
        let validators = CacheValidators {
            size_bytes: probe.size,
            etag: probe.etag.clone(),
            last_modified: probe.last_modified.clone(),
        };

        let engine = Arc::new(ChunkEngine::open(EngineConfig {
            identity,
            cache_backend: config.cache_backend,
            paths: CachePaths::new(&config.cache_dir),
            total_size: probe.size,
            chunk_size: config.options.chunk_size,
            validators,
            max_concurrent_fetches: config.options.max_concurrent_fetches,
            max_retries: config.options.max_retries,
            retry_base_delay_ms: config.options.retry_base_delay_ms,
            cache_limit_bytes: None,
        })?);

        let if_range = probe
            .validator()
            .filter(|validator| !is_weak_etag(validator))
            .map(|validator| validator.to_string());

        Ok(Self {
            inner: Arc::new(RangeInner {
                engine,
                http,
                url: std::sync::Mutex::new(url),
                lease: config.lease.clone(),
                probe,
                if_range,
                read_ahead_chunks: config.options.read_ahead_chunks,
                manifest: config.options.manifest.clone(),
                last_read_end: AtomicU64::new(u64::MAX),
            }),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.inner.engine.total_size()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.total_size()
    }

    /// The validator the cache identity is pinned to, if the server exposed
    /// one.
    pub fn validator(&self) -> Option<&str> {
        self.inner.probe.validator()
    }

    pub fn telemetry_snapshot(&self) -> StreamingTelemetry {
        self.inner.engine.telemetry_snapshot()
    }

    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamingDiskError> {
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

        // Sequential read pattern: best-effort prefetch of what follows.
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

    pub async fn flush(&self) -> Result<(), StreamingDiskError> {
        self.inner.engine.flush().await
    }

    /// Wipes the cache and resets telemetry.
    pub async fn clear_cache(&self) -> Result<(), StreamingDiskError> {
        self.inner.engine.clear_cache().await
    }

    pub async fn close(&self) -> Result<(), StreamingDiskError> {
        self.inner.engine.close().await
    }

    async fn ensure_chunk(&self, chunk: u64) -> Result<(), StreamingDiskError> {
        ChunkEngine::ensure_chunk_cached(&self.inner.engine, chunk, &|chunk| {
            self.fetch_chunk(chunk)
        })
        .await
    }

    /// One HTTP attempt for one chunk; retries live in the engine.
    async fn fetch_chunk(&self, chunk: u64) -> Result<Bytes, StreamingDiskError> {
        let engine = &self.inner.engine;
        let start = chunk * engine.chunk_size();
        let end_inclusive = start + engine.chunk_len(chunk) - 1;

        let mut refreshed = false;
        loop {
            let url = self.inner.url.lock().unwrap().clone();
            engine.record_range_request();
            let response = self
                .inner
                .http
                .get_range(
                    &url,
                    (start, end_inclusive),
                    self.inner.if_range.as_deref(),
                    engine.chunk_size(),
                )
                .await?;

            let status = response.head.status.as_u16();
            if (status == 401 || status == 403) && !refreshed {
                if let Some(lease) = &self.inner.lease {
                    refreshed = true;
                    let fresh = lease.refresh_url().await.map_err(StreamingDiskError::Http)?;
                    *self.inner.url.lock().unwrap() = fresh;
                    continue;
                }
            }

            let body = self.validate_range_response(&url, (start, end_inclusive), response)?;
            engine.record_download(body.len() as u64);

            if let Some(manifest) = &self.inner.manifest {
                verify_manifest_digest(manifest, chunk, &body)?;
            }
            return Ok(body);
        }
    }

    fn validate_range_response(
        &self,
        url: &Url,
        range: (u64, u64),
        response: http::HttpResponse,
    ) -> Result<Bytes, StreamingDiskError> {
        let head = &response.head;
        let status = head.status.as_u16();
        let stored = self.inner.probe.validator();

        match status {
            206 => {}
            // An `If-Range` mismatch downgrades to the full representation.
            // A 200 that echoes our own validator back cannot be a mismatch,
            // so the server simply ignored the Range header.
            200 if self.inner.if_range.is_some() => {
                let echoed = head.etag.as_deref().or(head.last_modified.as_deref());
                if echoed.is_some() && echoed == stored {
                    return Err(StreamingDiskError::RangeNotSupported);
                }
                return Err(StreamingDiskError::ValidatorMismatch {
                    expected: stored.map(|v| v.to_string()),
                    actual: head.etag.clone(),
                });
            }
            200 => return Err(StreamingDiskError::RangeNotSupported),
            412 => {
                return Err(StreamingDiskError::ValidatorMismatch {
                    expected: stored.map(|v| v.to_string()),
                    actual: head.etag.clone(),
                });
            }
            _ => {
                return Err(StreamingDiskError::HttpStatus {
                    status,
                    url: redacted(url),
                });
            }
        }

        if let Some(encoding) = &head.content_encoding {
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(StreamingDiskError::Protocol(format!(
                    "range response carries content-encoding {encoding}"
                )));
            }
        }

        let content_range = head
            .content_range
            .as_deref()
            .ok_or_else(|| StreamingDiskError::Protocol("206 without Content-Range".to_string()))?;
        let (got_start, got_end, total) = parse_content_range(content_range).ok_or_else(|| {
            StreamingDiskError::Protocol(format!("unparseable Content-Range {content_range:?}"))
        })?;
        if (got_start, got_end) != range {
            return Err(StreamingDiskError::Protocol(format!(
                "Content-Range {content_range:?} does not match the requested range \
                 {}-{}",
                range.0, range.1
            )));
        }
        if let Some(total) = total {
            if total != self.inner.probe.size {
                return Err(StreamingDiskError::Protocol(format!(
                    "Content-Range reports total {total}, probe said {}",
                    self.inner.probe.size
                )));
            }
        }

        // Validator drift is detectable even without `If-Range` (weak ETags):
        // a 206 that echoes a different validator means the image changed.
        if let (Some(stored), Some(current)) = (&self.inner.probe.etag, &head.etag) {
            if stored != current {
                return Err(StreamingDiskError::ValidatorMismatch {
                    expected: Some(stored.clone()),
                    actual: Some(current.clone()),
                });
            }
        }
        if self.inner.probe.etag.is_none() {
            if let (Some(stored), Some(current)) =
                (&self.inner.probe.last_modified, &head.last_modified)
            {
                if stored != current {
                    return Err(StreamingDiskError::ValidatorMismatch {
                        expected: Some(stored.clone()),
                        actual: Some(current.clone()),
                    });
                }
            }
        }

        Ok(response.body)
    }
}

fn verify_manifest_digest(
    manifest: &ChunkManifest,
    chunk: u64,
    body: &[u8],
) -> Result<(), StreamingDiskError> {
    use sha2::{Digest, Sha256};

    let Some(expected) = manifest.sha256.get(chunk as usize) else {
        return Err(StreamingDiskError::Protocol(format!(
            "no manifest digest for chunk {chunk}"
        )));
    };
    let actual: [u8; 32] = Sha256::digest(body).into();
    if actual != *expected {
        return Err(StreamingDiskError::Integrity {
            chunk_index: chunk,
            expected: hex_digest(expected),
            actual: hex_digest(&actual),
        });
    }
    Ok(())
}

pub(crate) fn hex_digest(digest: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Validates a read request and returns the chunk span it touches, or `None`
/// for an empty read.
pub(crate) fn check_read_span(
    engine: &Arc<ChunkEngine>,
    offset: u64,
    len: usize,
) -> Result<Option<(u64, u64)>, StreamingDiskError> {
    if engine.is_closed() {
        return Err(StreamingDiskError::Closed);
    }
    if len == 0 {
        return Ok(None);
    }
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > engine.total_size() {
        return Err(StreamingDiskError::Disk(DiskError::OutOfBounds {
            offset,
            len,
            capacity: engine.total_size(),
        }));
    }
    let chunk_size = engine.chunk_size();
    Ok(Some((offset / chunk_size, (end - 1) / chunk_size)))
}

/// Serves a read from the cache after its chunks were ensured, re-ensuring
/// chunks that went missing underneath us (external deletion healing).
pub(crate) async fn serve_cached_range<'a, E, Fut>(
    engine: &Arc<ChunkEngine>,
    offset: u64,
    buf: &mut [u8],
    ensure: &'a E,
) -> Result<(), StreamingDiskError>
where
    E: Fn(u64) -> Fut + 'a,
    Fut: std::future::Future<Output = Result<(), StreamingDiskError>> + 'a,
{
    let chunk_size = engine.chunk_size();
    let mut cursor = offset;
    let mut filled = 0usize;
    while filled < buf.len() {
        let chunk = cursor / chunk_size;
        let within = cursor % chunk_size;
        let n = ((chunk_size - within) as usize).min(buf.len() - filled);

        // Externally deleted chunk files surface as misses; refetch and retry
        // a bounded number of times before giving up.
        let mut attempts = 0u32;
        loop {
            if engine
                .read_chunk(chunk, within, &mut buf[filled..filled + n])
                .await?
            {
                break;
            }
            attempts += 1;
            if attempts > 2 {
                return Err(StreamingDiskError::Protocol(format!(
                    "chunk {chunk} repeatedly missing from the cache"
                )));
            }
            ensure(chunk).await?;
        }

        filled += n;
        cursor += n as u64;
    }
    Ok(())
}

/// Determines the remote image's size and validators.
///
/// `HEAD` first; when that cannot determine the size, a one-byte range GET
/// whose `Content-Range` reveals the total. A 200 response to the range probe
/// means the server ignored `Range` entirely.
async fn probe_remote(http: &HttpClient, url: &Url) -> Result<RemoteProbe, StreamingDiskError> {
    let head = match http.head(url).await {
        Ok(head) => Some(head),
        Err(StreamingDiskError::Http(_)) => None,
        Err(err) => return Err(err),
    };

    if let Some(head) = &head {
        let status = head.status.as_u16();
        if head.status.is_success() {
            if let Some(size) = head.content_length {
                return finish_probe(size, head);
            }
        } else if status != 405 && status != 501 {
            return Err(StreamingDiskError::HttpStatus {
                status,
                url: redacted(url),
            });
        }
    }

    // Range probe fallback.
    let response = http.get_range(url, (0, 0), None, MAX_CHUNK_SIZE).await?;
    let head = response.head;
    match head.status.as_u16() {
        206 => {}
        200 => return Err(StreamingDiskError::RangeNotSupported),
        status => {
            return Err(StreamingDiskError::HttpStatus {
                status,
                url: redacted(url),
            });
        }
    }
    let content_range = head
        .content_range
        .as_deref()
        .ok_or_else(|| StreamingDiskError::Protocol("206 without Content-Range".to_string()))?;
    let (_, _, total) = parse_content_range(content_range).ok_or_else(|| {
        StreamingDiskError::Protocol(format!("unparseable Content-Range {content_range:?}"))
    })?;
    let total = total.ok_or_else(|| {
        StreamingDiskError::Protocol("range probe did not reveal the total size".to_string())
    })?;
    finish_probe(total, &head)
}

fn finish_probe(size: u64, head: &ResponseHead) -> Result<RemoteProbe, StreamingDiskError> {
    if size == 0 {
        return Err(StreamingDiskError::Protocol(
            "remote image is empty".to_string(),
        ));
    }
    if size % crate::SECTOR_SIZE as u64 != 0 {
        return Err(StreamingDiskError::Protocol(format!(
            "remote image size {size} is not a multiple of 512"
        )));
    }
    Ok(RemoteProbe {
        size,
        etag: head.etag.clone(),
        last_modified: head.last_modified.clone(),
    })
}

/// Fans chunk ensures out over cloned disks so a single read can download
/// multiple chunks concurrently (bounded by the engine's semaphore).
pub(crate) async fn fan_out_ensure<D, F, Fut>(
    disk: &D,
    chunks: std::ops::RangeInclusive<u64>,
    spawn_ensure: F,
) -> Result<(), StreamingDiskError>
where
    D: Clone + Send + Sync + 'static,
    F: Fn(D, u64) -> Fut,
    Fut: std::future::Future<Output = Result<(), StreamingDiskError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for chunk in chunks {
        set.spawn(spawn_ensure(disk.clone(), chunk));
    }
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let result = joined
            .map_err(|err| StreamingDiskError::Http(format!("fetch task failed: {err}")))?;
        if let Err(err) = result {
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
