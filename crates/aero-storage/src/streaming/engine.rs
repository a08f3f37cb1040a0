//! Shared chunk pipeline of the range and chunked streaming disks.
//!
//! One engine owns a persistent chunk cache (store + metadata) and the
//! machinery around it: inflight-fetch coalescing, the fetch-concurrency
//! semaphore, retry with exponential backoff, cache-generation tracking
//! across invalidations, cache-limit LRU eviction and the deferred flush
//! that follows each stored chunk.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{watch, Mutex, Semaphore};

use crate::error::DiskError;

use super::meta::{
    load_metadata, now_ms, store_metadata, CacheIdentity, CacheMetadata, CacheValidators,
};
use super::store::{CachePaths, ChunkStore};
use super::{StreamingCacheBackend, StreamingDiskError, StreamingTelemetry};

/// Delay between a stored chunk and the coalesced background flush.
const DEFERRED_FLUSH_DELAY: Duration = Duration::from_millis(250);

pub(crate) struct EngineConfig {
    pub identity: CacheIdentity,
    pub cache_backend: StreamingCacheBackend,
    pub paths: CachePaths,
    pub total_size: u64,
    pub chunk_size: u64,
    pub validators: CacheValidators,
    pub max_concurrent_fetches: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub cache_limit_bytes: Option<u64>,
}

struct EngineState {
    store: ChunkStore,
    meta: CacheMetadata,
    /// Bumped on every invalidation; fetches finishing against a stale
    /// generation are discarded instead of stored.
    generation: u64,
}

struct InflightFetch {
    generation: u64,
    done: watch::Receiver<bool>,
}

pub(crate) struct ChunkEngine {
    identity: CacheIdentity,
    cache_backend: StreamingCacheBackend,
    paths: CachePaths,
    total_size: u64,
    chunk_size: u64,
    chunk_count: u64,
    max_retries: u32,
    retry_base_delay_ms: u64,
    cache_limit_bytes: Option<u64>,
    state: Mutex<EngineState>,
    inflight: StdMutex<HashMap<u64, InflightFetch>>,
    fetch_permits: Semaphore,
    telemetry: StdMutex<StreamingTelemetry>,
    closed: AtomicBool,
    flush_pending: AtomicBool,
}

enum FetchRole {
    /// This caller owns the fetch; completion is published on the sender.
    Owner {
        sender: watch::Sender<bool>,
        generation: u64,
    },
    /// Another caller is already fetching the chunk for this generation.
    Joiner(watch::Receiver<bool>),
}

impl ChunkEngine {
    /// Opens or (re)creates the on-disk cache described by `config`.
    ///
    /// The existing cache is reused only when its metadata matches the
    /// identity and probed validators; anything else — missing, corrupt or
    /// semantically invalid metadata, a store that cannot be opened, a store
    /// that disagrees with the metadata — wipes the directory and starts
    /// fresh.
    pub fn open(config: EngineConfig) -> Result<Self, StreamingDiskError> {
        std::fs::create_dir_all(&config.paths.root)
            .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;

        let chunk_count = config.total_size.div_ceil(config.chunk_size);
        let reopened = Self::try_reuse(&config);
        let (store, meta) = match reopened {
            Some(pair) => pair,
            None => {
                config.paths.wipe()?;
                let store = ChunkStore::create(
                    config.cache_backend,
                    &config.paths,
                    config.total_size,
                    config.chunk_size,
                )?;
                let meta = CacheMetadata::fresh(&config.identity, config.validators.clone());
                store_metadata(&config.paths.metadata(), &meta)
                    .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;
                (store, meta)
            }
        };

        let cached_bytes = meta.cached_bytes();
        let mut engine = Self {
            identity: config.identity,
            cache_backend: config.cache_backend,
            paths: config.paths,
            total_size: config.total_size,
            chunk_size: config.chunk_size,
            chunk_count,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            cache_limit_bytes: config.cache_limit_bytes,
            state: Mutex::new(EngineState {
                store,
                meta,
                generation: 0,
            }),
            inflight: StdMutex::new(HashMap::new()),
            fetch_permits: Semaphore::new(config.max_concurrent_fetches),
            telemetry: StdMutex::new(StreamingTelemetry {
                total_size: config.total_size,
                block_size: config.chunk_size,
                cached_bytes,
                ..StreamingTelemetry::default()
            }),
            closed: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
        };

        // A shrunken cache limit evicts eagerly at open, not lazily on the
        // next store.
        if engine.cache_limit_bytes.is_some() {
            let state = engine.state.get_mut();
            Self::evict_to_fit(
                state,
                engine.cache_limit_bytes,
                engine.total_size,
                0,
            )?;
            let cached = state.meta.cached_bytes();
            engine.telemetry.lock().unwrap().cached_bytes = cached;
        }

        Ok(engine)
    }

    fn try_reuse(config: &EngineConfig) -> Option<(ChunkStore, CacheMetadata)> {
        let meta = load_metadata(&config.paths.metadata())?;
        if !meta.matches(&config.identity, &config.validators) {
            return None;
        }
        if !meta.ranges_valid(config.total_size) {
            return None;
        }
        let store = ChunkStore::open(
            config.cache_backend,
            &config.paths,
            config.total_size,
            config.chunk_size,
        )
        .ok()?;
        if !store.consistent_with(&meta) {
            return None;
        }
        Some((store, meta))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn telemetry_snapshot(&self) -> StreamingTelemetry {
        self.telemetry.lock().unwrap().clone()
    }

    pub fn record_range_request(&self) {
        self.telemetry.lock().unwrap().range_requests += 1;
    }

    /// Records image bytes received over HTTP. Called by the fetchers as soon
    /// as a body arrives, so failed digest checks still show up as download
    /// traffic.
    pub fn record_download(&self, len: u64) {
        self.telemetry.lock().unwrap().bytes_downloaded += len;
    }

    /// Ensures chunk `chunk` is materialized in the cache.
    ///
    /// `fetch` downloads one chunk and is invoked with the chunk index; the
    /// engine owns retries, coalescing and storage. A `ValidatorMismatch`
    /// escaping `fetch` triggers at most one full cache invalidation before
    /// the error is surfaced.
    pub async fn ensure_chunk_cached<F, Fut>(
        engine: &Arc<Self>,
        chunk: u64,
        fetch: &F,
    ) -> Result<(), StreamingDiskError>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<Bytes, StreamingDiskError>>,
    {
        if chunk >= engine.chunk_count {
            return Err(StreamingDiskError::Protocol(format!(
                "chunk {chunk} out of range"
            )));
        }

        let mut counted = false;
        let mut invalidated = false;
        loop {
            if engine.is_closed() {
                return Err(StreamingDiskError::Closed);
            }

            // Fast path; also where joiners land after being woken.
            let generation = {
                let state = engine.state.lock().await;
                if state.store.has_chunk(chunk, &state.meta) {
                    if !counted {
                        engine.telemetry.lock().unwrap().cache_hit_chunks += 1;
                    }
                    return Ok(());
                }
                state.generation
            };

            let role = {
                let mut inflight = engine.inflight.lock().unwrap();
                match inflight.get(&chunk) {
                    Some(entry) if entry.generation == generation => {
                        FetchRole::Joiner(entry.done.clone())
                    }
                    _ => {
                        let (sender, done) = watch::channel(false);
                        inflight.insert(chunk, InflightFetch { generation, done });
                        FetchRole::Owner { sender, generation }
                    }
                }
            };

            match role {
                FetchRole::Joiner(mut done) => {
                    if !counted {
                        engine.telemetry.lock().unwrap().inflight_joins += 1;
                        counted = true;
                    }
                    // A dropped sender means the owner failed; loop and retry.
                    let _ = done.wait_for(|finished| *finished).await;
                }
                FetchRole::Owner { sender, generation } => {
                    if !counted {
                        engine.telemetry.lock().unwrap().cache_miss_chunks += 1;
                        counted = true;
                    }

                    let result = Self::fetch_and_store(engine, chunk, generation, fetch).await;

                    engine.inflight.lock().unwrap().remove(&chunk);
                    let _ = sender.send(true);

                    match result {
                        Ok(()) => {}
                        Err(StreamingDiskError::ValidatorMismatch { .. }) if !invalidated => {
                            invalidated = true;
                            engine.invalidate().await?;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// One owned download: permit, retry loop, stale-generation discard,
    /// eviction, store, deferred flush.
    async fn fetch_and_store<F, Fut>(
        engine: &Arc<Self>,
        chunk: u64,
        generation: u64,
        fetch: &F,
    ) -> Result<(), StreamingDiskError>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<Bytes, StreamingDiskError>>,
    {
        let _permit = engine
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| StreamingDiskError::Closed)?;

        {
            let mut telemetry = engine.telemetry.lock().unwrap();
            telemetry.inflight_fetches += 1;
            telemetry.block_requests += 1;
        }
        let result = engine.download_with_retries(chunk, fetch).await;
        engine.telemetry.lock().unwrap().inflight_fetches -= 1;

        let body = result?;

        let mut state = engine.state.lock().await;
        if state.generation != generation {
            // The cache was invalidated while we were downloading; the bytes
            // belong to a generation that no longer exists.
            return Ok(());
        }

        Self::evict_to_fit(
            &mut state,
            engine.cache_limit_bytes,
            engine.total_size,
            body.len() as u64,
        )?;
        state.store.write_chunk(chunk, &body)?;
        state.meta.insert_chunk(chunk, engine.total_size);
        store_metadata(&engine.paths.metadata(), &state.meta)
            .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;

        let cached = state.meta.cached_bytes();
        drop(state);
        engine.telemetry.lock().unwrap().cached_bytes = cached;
        Self::schedule_deferred_flush(engine);
        Ok(())
    }

    async fn download_with_retries<F, Fut>(
        &self,
        chunk: u64,
        fetch: &F,
    ) -> Result<Bytes, StreamingDiskError>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<Bytes, StreamingDiskError>>,
    {
        let expected_len = self.chunk_len(chunk);
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            match fetch(chunk).await {
                Ok(body) => {
                    if body.len() as u64 != expected_len {
                        return Err(StreamingDiskError::Protocol(format!(
                            "chunk {chunk}: expected {expected_len} bytes, got {}",
                            body.len()
                        )));
                    }
                    let elapsed = started.elapsed().as_millis() as u64;
                    let start = chunk * self.chunk_size;
                    let mut telemetry = self.telemetry.lock().unwrap();
                    telemetry.last_fetch_ms = Some(elapsed);
                    telemetry.last_fetch_at_ms = Some(now_ms());
                    telemetry.last_fetch_range = Some((start, start + expected_len));
                    return Ok(body);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_retries || !is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.retry_base_delay_ms.saturating_mul(1 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Unpadded length of chunk `chunk`.
    pub fn chunk_len(&self, chunk: u64) -> u64 {
        let start = chunk * self.chunk_size;
        (self.total_size - start).min(self.chunk_size)
    }

    fn evict_to_fit(
        state: &mut EngineState,
        limit: Option<u64>,
        total_size: u64,
        incoming: u64,
    ) -> Result<(), StreamingDiskError> {
        let Some(limit) = limit else { return Ok(()) };
        while state.meta.cached_bytes() + incoming > limit {
            let Some(victim) = state.meta.lru_chunk() else {
                break;
            };
            state.store.remove_chunk(victim)?;
            state.meta.remove_chunk(victim, total_size);
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes of chunk `chunk` starting at `within`,
    /// assuming the chunk was ensured. `Ok(false)` reports a chunk that went
    /// missing underneath us (external deletion); callers re-ensure and retry.
    pub async fn read_chunk(
        &self,
        chunk: u64,
        within: u64,
        buf: &mut [u8],
    ) -> Result<bool, StreamingDiskError> {
        let mut state = self.state.lock().await;
        let present = state.store.read_chunk(chunk, within, buf)?;
        if present {
            state.meta.touch_chunk(chunk);
        } else if state.meta.covers_chunk(chunk) {
            // Heal the metadata so has_chunk stops claiming the chunk.
            state.meta.remove_chunk(chunk, self.total_size);
            let cached = state.meta.cached_bytes();
            drop(state);
            self.telemetry.lock().unwrap().cached_bytes = cached;
        }
        Ok(present)
    }

    /// Wipes and recreates the cache in one step, bumping the generation.
    /// Inflight fetches from the old generation discard their results.
    pub async fn invalidate(&self) -> Result<(), StreamingDiskError> {
        let mut state = self.state.lock().await;
        self.paths.wipe()?;
        let store = ChunkStore::create(
            self.cache_backend,
            &self.paths,
            self.total_size,
            self.chunk_size,
        )?;
        let meta = CacheMetadata::fresh(&self.identity, state.meta.validators.clone());
        store_metadata(&self.paths.metadata(), &meta)
            .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;
        state.store = store;
        state.meta = meta;
        state.generation += 1;
        drop(state);

        self.inflight.lock().unwrap().clear();
        self.telemetry.lock().unwrap().cached_bytes = 0;
        Ok(())
    }

    /// Invalidates and additionally resets the telemetry counters.
    pub async fn clear_cache(&self) -> Result<(), StreamingDiskError> {
        self.invalidate().await?;
        let mut telemetry = self.telemetry.lock().unwrap();
        *telemetry = StreamingTelemetry {
            total_size: self.total_size,
            block_size: self.chunk_size,
            ..StreamingTelemetry::default()
        };
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), StreamingDiskError> {
        let mut state = self.state.lock().await;
        state.store.flush()?;
        store_metadata(&self.paths.metadata(), &state.meta)
            .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), StreamingDiskError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.store.flush()?;
        store_metadata(&self.paths.metadata(), &state.meta)
            .map_err(|err| StreamingDiskError::Disk(DiskError::io(err)))?;
        Ok(())
    }

    /// Schedules the coalesced post-store flush; at most one is pending.
    fn schedule_deferred_flush(engine: &Arc<Self>) {
        if engine.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            tokio::time::sleep(DEFERRED_FLUSH_DELAY).await;
            engine.flush_pending.store(false, Ordering::SeqCst);
            if engine.is_closed() {
                return;
            }
            let _ = engine.flush().await;
        });
    }
}

/// Retry policy: transient transport and server failures plus integrity
/// mismatches retry; everything else surfaces immediately.
fn is_retryable(err: &StreamingDiskError) -> bool {
    match err {
        StreamingDiskError::Http(_) => true,
        StreamingDiskError::HttpStatus { status, .. } => {
            *status == 408 || *status == 429 || *status >= 500
        }
        StreamingDiskError::Integrity { .. } => true,
        _ => false,
    }
}
