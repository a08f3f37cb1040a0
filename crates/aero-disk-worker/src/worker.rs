//! The runtime disk worker: a single sequential actor owning every open disk
//! handle.
//!
//! Requests drain from one inbound channel and are processed strictly in
//! arrival order; a response for message N is emitted before message N+1's
//! handler starts, even when N suspends on I/O. Every accepted request gets
//! exactly one response; envelopes too malformed to answer are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use aero_storage::{
    AeroCowDisk, AeroSparseConfig, AeroSparseDisk, ChunkedStreamingDisk,
    ChunkedStreamingDiskConfig, DiskFormat, DiskImage, FileBackend, StreamingCacheBackend,
    StreamingDisk, StreamingDiskConfig, SECTOR_SIZE,
};
use url::Url;

use crate::protocol::{
    error_response, ok_response, parse_envelope, BenchPayload, CacheBackendSpec, DeliveryKind,
    DiskOpenSpec, ErrorKind, HandlePayload, LocalFormatSpec, OpenRemotePayload, ReadIntoPayload,
    ReadPayload, RemoteDiskOptions, WorkerError, WriteFromPayload, WritePayload,
    MAX_SAFE_INTEGER, RUNTIME_DISK_MAX_IO_BYTES,
};
use crate::runtime_disk::{
    LocalDisk, LocalRuntimeDisk, RemoteBase, RemoteOverlayDisk, RemoteRuntimeDisk, RuntimeDisk,
};
use crate::shared::SharedBuffer;
use crate::snapshot::{SnapshotEntry, WorkerSnapshot};

/// Block size of overlays the worker creates on demand.
const OVERLAY_BLOCK_SIZE: u32 = 4096;

const BENCH_DEFAULT_TOTAL: u64 = 4 * 1024 * 1024;
const BENCH_DEFAULT_CHUNK: u64 = 64 * 1024;
const BENCH_MAX_TOTAL: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiskWorkerOptions {
    /// Root under which remote-disk caches are placed when the open spec does
    /// not name a cache directory.
    pub cache_root: PathBuf,
}

/// Inbound message: JSON envelope plus optional binary payload and optional
/// shared-buffer reference.
#[derive(Debug)]
pub struct WorkerMessage {
    pub envelope: Value,
    pub binary: Option<Vec<u8>>,
    pub shared: Option<SharedBuffer>,
}

impl WorkerMessage {
    pub fn request(envelope: Value) -> Self {
        Self {
            envelope,
            binary: None,
            shared: None,
        }
    }
}

#[derive(Debug)]
pub struct WorkerResponse {
    pub envelope: Value,
    pub binary: Option<Vec<u8>>,
}

pub struct DiskWorkerHandle {
    pub requests: mpsc::UnboundedSender<WorkerMessage>,
    pub responses: mpsc::UnboundedReceiver<WorkerResponse>,
}

/// Spawns a worker onto the current tokio runtime.
pub fn spawn_disk_worker(options: DiskWorkerOptions) -> DiskWorkerHandle {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let worker = DiskWorker::new(options, response_tx);
    tokio::spawn(worker.run(request_rx));
    DiskWorkerHandle {
        requests: request_tx,
        responses: response_rx,
    }
}

/// Per-handle I/O counters. `reads`/`writes`/`flushes` count attempts;
/// `last*Ms` is stamped only on success.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoCounters {
    pub reads: u64,
    pub bytes_read: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub inflight_reads: u64,
    pub inflight_writes: u64,
    pub inflight_flushes: u64,
    pub last_read_ms: Option<u64>,
    pub last_write_ms: Option<u64>,
    pub last_flush_ms: Option<u64>,
}

struct DiskEntry {
    disk: Box<dyn RuntimeDisk>,
    read_only: bool,
    backend: Option<DiskOpenSpec>,
    counters: IoCounters,
}

struct OpOutput {
    result: Value,
    binary: Option<Vec<u8>>,
}

impl OpOutput {
    fn result(result: Value) -> Self {
        Self {
            result,
            binary: None,
        }
    }
}

pub struct DiskWorker {
    options: DiskWorkerOptions,
    entries: HashMap<u64, DiskEntry>,
    next_handle: u64,
    epoch: Instant,
    responses: mpsc::UnboundedSender<WorkerResponse>,
}

impl DiskWorker {
    fn new(options: DiskWorkerOptions, responses: mpsc::UnboundedSender<WorkerResponse>) -> Self {
        Self {
            options,
            entries: HashMap::new(),
            next_handle: 1,
            epoch: Instant::now(),
            responses,
        }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<WorkerMessage>) {
        while let Some(message) = requests.recv().await {
            let Some(envelope) = parse_envelope(&message.envelope) else {
                warn!("dropping malformed worker message");
                continue;
            };
            debug!(request_id = envelope.request_id, op = %envelope.op, "dispatching");

            let outcome = self
                .dispatch(&envelope.op, envelope.payload, message.binary, message.shared)
                .await;
            let response = match outcome {
                Ok(output) => WorkerResponse {
                    envelope: ok_response(envelope.request_id, output.result),
                    binary: output.binary,
                },
                Err(err) => {
                    debug!(request_id = envelope.request_id, op = %envelope.op,
                           kind = err.kind.name(), "request failed: {}", err.message);
                    WorkerResponse {
                        envelope: error_response(envelope.request_id, &err),
                        binary: None,
                    }
                }
            };
            if self.responses.send(response).is_err() {
                break;
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn dispatch(
        &mut self,
        op: &str,
        payload: Value,
        binary: Option<Vec<u8>>,
        shared: Option<SharedBuffer>,
    ) -> Result<OpOutput, WorkerError> {
        match op {
            "open" => self.op_open(payload).await,
            "openRemote" => self.op_open_remote(payload, DeliveryKind::Range).await,
            "openChunked" => self.op_open_remote(payload, DeliveryKind::Chunked).await,
            "close" => self.op_close(payload).await,
            "flush" => self.op_flush(payload).await,
            "clearCache" => self.op_clear_cache(payload).await,
            "read" => self.op_read(payload).await,
            "readInto" => self.op_read_into(payload, shared).await,
            "write" => self.op_write(payload, binary).await,
            "writeFrom" => self.op_write_from(payload, shared).await,
            "stats" => self.op_stats(payload),
            "bench" => self.op_bench(payload).await,
            "prepareSnapshot" => self.op_prepare_snapshot().await,
            "restoreFromSnapshot" => self.op_restore_from_snapshot(binary).await,
            _ => Err(WorkerError::new(
                ErrorKind::InvalidConfig,
                format!("unknown op {op:?}"),
            )),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, WorkerError> {
        serde_json::from_value(payload)
            .map_err(|err| WorkerError::new(ErrorKind::InvalidConfig, format!("bad payload: {err}")))
    }

    fn entry_mut(&mut self, handle: u64) -> Result<&mut DiskEntry, WorkerError> {
        self.entries.get_mut(&handle).ok_or_else(|| {
            WorkerError::new(ErrorKind::NotFound, format!("unknown disk handle {handle}"))
        })
    }

    // -- open ------------------------------------------------------------

    async fn op_open(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let spec: DiskOpenSpec = Self::decode(payload)?;
        self.open_and_register(spec).await
    }

    async fn op_open_remote(
        &mut self,
        payload: Value,
        delivery: DeliveryKind,
    ) -> Result<OpOutput, WorkerError> {
        let remote: OpenRemotePayload = Self::decode(payload)?;
        let spec = DiskOpenSpec::Remote {
            delivery,
            url: remote.url,
            image_id: remote.image_id,
            image_version: remote.image_version,
            cache_dir: remote.cache_dir,
            cache_backend: remote.cache_backend,
            cache_limit_bytes: remote.cache_limit_bytes,
            options: remote.options,
            overlay_path: remote.overlay_path,
        };
        self.open_and_register(spec).await
    }

    async fn open_and_register(&mut self, spec: DiskOpenSpec) -> Result<OpOutput, WorkerError> {
        let (disk, read_only, descriptor) = self.open_spec(spec).await?;
        let handle = self.next_handle;
        self.next_handle += 1;
        let capacity = disk.capacity_bytes();
        self.entries.insert(
            handle,
            DiskEntry {
                disk,
                read_only,
                backend: Some(descriptor),
                counters: IoCounters::default(),
            },
        );
        Ok(OpOutput::result(json!({
            "handle": handle,
            "sectorSize": SECTOR_SIZE,
            "capacityBytes": capacity,
            "readOnly": read_only,
        })))
    }

    /// Resolves an open spec into a live disk plus the descriptor to embed in
    /// snapshots (derived settings baked in, remote URL query stripped).
    async fn open_spec(
        &self,
        spec: DiskOpenSpec,
    ) -> Result<(Box<dyn RuntimeDisk>, bool, DiskOpenSpec), WorkerError> {
        match spec {
            DiskOpenSpec::Local {
                path,
                format,
                read_only,
                overlay_path,
            } => {
                let backend = if read_only && overlay_path.is_none() {
                    FileBackend::open_read_only(&path)?
                } else if overlay_path.is_some() {
                    FileBackend::open_read_only(&path)?
                } else {
                    FileBackend::open_rw(&path)?
                };
                let image = match format {
                    LocalFormatSpec::Auto => DiskImage::open_auto(backend)?,
                    LocalFormatSpec::Raw => DiskImage::open_with_format(DiskFormat::Raw, backend)?,
                    LocalFormatSpec::Aerospar => {
                        DiskImage::open_with_format(DiskFormat::AeroSparse, backend)?
                    }
                };

                let disk = match &overlay_path {
                    None => LocalDisk::Plain(image),
                    Some(overlay) => {
                        let capacity = aero_storage::VirtualDisk::capacity_bytes(&image);
                        let overlay = open_or_create_overlay(overlay, capacity)?;
                        LocalDisk::Cow(AeroCowDisk::open(image, overlay.into_backend())?)
                    }
                };
                let read_only = read_only && overlay_path.is_none();
                let descriptor = DiskOpenSpec::Local {
                    path,
                    format,
                    read_only,
                    overlay_path,
                };
                Ok((
                    Box::new(LocalRuntimeDisk::new(disk)),
                    read_only,
                    descriptor,
                ))
            }
            DiskOpenSpec::Remote {
                delivery,
                url,
                image_id,
                image_version,
                cache_dir,
                cache_backend,
                cache_limit_bytes,
                options,
                overlay_path,
            } => {
                let parsed_url = Url::parse(&url).map_err(|err| {
                    WorkerError::new(ErrorKind::InvalidConfig, format!("bad url: {err}"))
                })?;
                let cache_dir = match &cache_dir {
                    Some(dir) => PathBuf::from(dir),
                    None => self
                        .options
                        .cache_root
                        .join(derive_cache_key(&parsed_url, image_id.as_deref(), delivery)),
                };

                let base = match delivery {
                    DeliveryKind::Range => {
                        let mut config = StreamingDiskConfig::new(parsed_url.clone(), &cache_dir);
                        config.cache_backend = cache_backend_of(cache_backend);
                        config.image_id = image_id.clone();
                        config.image_version = image_version.clone();
                        apply_remote_options(&mut config.options, &options);
                        RemoteBase::Range(StreamingDisk::open(config).await?)
                    }
                    DeliveryKind::Chunked => {
                        let mut config =
                            ChunkedStreamingDiskConfig::new(parsed_url.clone(), &cache_dir);
                        config.cache_backend = cache_backend_of(cache_backend);
                        config.image_id = image_id.clone();
                        config.cache_limit_bytes = cache_limit_bytes;
                        apply_remote_options(&mut config.options, &options);
                        RemoteBase::Chunked(ChunkedStreamingDisk::open(config).await?)
                    }
                };

                // Snapshots must never carry query secrets (signed URLs).
                let mut stored_url = parsed_url;
                stored_url.set_query(None);
                stored_url.set_fragment(None);
                let descriptor = DiskOpenSpec::Remote {
                    delivery,
                    url: stored_url.to_string(),
                    image_id,
                    image_version,
                    cache_dir: Some(cache_dir.to_string_lossy().into_owned()),
                    cache_backend,
                    cache_limit_bytes,
                    options,
                    overlay_path: overlay_path.clone(),
                };

                match overlay_path {
                    None => Ok((
                        Box::new(RemoteRuntimeDisk::new(base)),
                        true,
                        descriptor,
                    )),
                    Some(overlay) => {
                        let overlay_disk = open_or_create_overlay(&overlay, base.capacity_bytes())?;
                        Ok((
                            Box::new(RemoteOverlayDisk::new(base, overlay_disk)?),
                            false,
                            descriptor,
                        ))
                    }
                }
            }
        }
    }

    // -- lifecycle -------------------------------------------------------

    async fn op_close(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: HandlePayload = Self::decode(payload)?;
        let mut entry = self.entries.remove(&p.handle).ok_or_else(|| {
            WorkerError::new(ErrorKind::NotFound, format!("unknown disk handle {}", p.handle))
        })?;
        // Flush is part of close; a flush failure still releases the handle.
        let result = entry.disk.close().await;
        if let Err(err) = &result {
            warn!(handle = p.handle, "close reported {}", err.message);
        }
        Ok(OpOutput::result(json!({ "closed": true })))
    }

    async fn op_flush(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: HandlePayload = Self::decode(payload)?;
        let now = self.now_ms();
        let entry = self.entry_mut(p.handle)?;
        entry.counters.flushes += 1;
        entry.counters.inflight_flushes += 1;
        let result = entry.disk.flush().await;
        entry.counters.inflight_flushes -= 1;
        result?;
        entry.counters.last_flush_ms = Some(now);
        Ok(OpOutput::result(json!({ "flushed": true })))
    }

    async fn op_clear_cache(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: HandlePayload = Self::decode(payload)?;
        let entry = self.entry_mut(p.handle)?;
        let cleared = entry.disk.clear_cache().await?;
        if cleared {
            entry.counters = IoCounters::default();
        }
        Ok(OpOutput::result(json!({ "cleared": cleared })))
    }

    // -- I/O -------------------------------------------------------------

    async fn op_read(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: ReadPayload = Self::decode(payload)?;
        let now = self.now_ms();
        let entry = self.entry_mut(p.handle)?;
        let offset = validate_sector_io(entry.disk.capacity_bytes(), p.lba, p.byte_length)?;

        entry.counters.reads += 1;
        entry.counters.inflight_reads += 1;
        let mut buf = vec![0u8; p.byte_length as usize];
        let result = entry.disk.read_at(offset, &mut buf).await;
        entry.counters.inflight_reads -= 1;
        result?;
        entry.counters.bytes_read += p.byte_length;
        entry.counters.last_read_ms = Some(now);

        Ok(OpOutput {
            result: json!({ "byteLength": p.byte_length }),
            binary: Some(buf),
        })
    }

    async fn op_read_into(
        &mut self,
        payload: Value,
        shared: Option<SharedBuffer>,
    ) -> Result<OpOutput, WorkerError> {
        let p: ReadIntoPayload = Self::decode(payload)?;
        let shared = shared.ok_or_else(|| {
            WorkerError::new(ErrorKind::InvalidConfig, "readInto requires a shared buffer")
        })?;
        let now = self.now_ms();
        let entry = self.entry_mut(p.handle)?;
        let offset = validate_sector_io(entry.disk.capacity_bytes(), p.lba, p.byte_length)?;
        // Window bounds are validated before any counter moves.
        let end = p
            .buffer_offset
            .checked_add(p.byte_length)
            .ok_or_else(|| WorkerError::new(ErrorKind::Overflow, "shared window overflows"))?;
        if end > shared.len() as u64 {
            return Err(WorkerError::new(
                ErrorKind::OutOfRange,
                "shared window exceeds the provided buffer",
            ));
        }

        entry.counters.reads += 1;
        entry.counters.inflight_reads += 1;
        let mut buf = vec![0u8; p.byte_length as usize];
        let result = entry.disk.read_at(offset, &mut buf).await;
        entry.counters.inflight_reads -= 1;
        result?;
        shared.write_window(p.buffer_offset, &buf)?;
        entry.counters.bytes_read += p.byte_length;
        entry.counters.last_read_ms = Some(now);

        Ok(OpOutput::result(json!({ "byteLength": p.byte_length })))
    }

    async fn op_write(
        &mut self,
        payload: Value,
        binary: Option<Vec<u8>>,
    ) -> Result<OpOutput, WorkerError> {
        let p: WritePayload = Self::decode(payload)?;
        let data = binary.ok_or_else(|| {
            WorkerError::new(ErrorKind::InvalidConfig, "write requires a binary payload")
        })?;
        let now = self.now_ms();
        let entry = self.entry_mut(p.handle)?;
        if entry.read_only {
            return Err(WorkerError::new(ErrorKind::ReadOnly, "disk is read-only"));
        }
        let offset = validate_sector_io(entry.disk.capacity_bytes(), p.lba, data.len() as u64)?;

        entry.counters.writes += 1;
        entry.counters.inflight_writes += 1;
        let result = entry.disk.write_at(offset, &data).await;
        entry.counters.inflight_writes -= 1;
        result?;
        entry.counters.bytes_written += data.len() as u64;
        entry.counters.last_write_ms = Some(now);

        Ok(OpOutput::result(json!({ "byteLength": data.len() })))
    }

    async fn op_write_from(
        &mut self,
        payload: Value,
        shared: Option<SharedBuffer>,
    ) -> Result<OpOutput, WorkerError> {
        let p: WriteFromPayload = Self::decode(payload)?;
        let shared = shared.ok_or_else(|| {
            WorkerError::new(ErrorKind::InvalidConfig, "writeFrom requires a shared buffer")
        })?;
        let now = self.now_ms();
        let entry = self.entry_mut(p.handle)?;
        if entry.read_only {
            return Err(WorkerError::new(ErrorKind::ReadOnly, "disk is read-only"));
        }
        let offset = validate_sector_io(entry.disk.capacity_bytes(), p.lba, p.byte_length)?;
        let data = shared.read_window(p.buffer_offset, p.byte_length)?;

        entry.counters.writes += 1;
        entry.counters.inflight_writes += 1;
        let result = entry.disk.write_at(offset, &data).await;
        entry.counters.inflight_writes -= 1;
        result?;
        entry.counters.bytes_written += p.byte_length;
        entry.counters.last_write_ms = Some(now);

        Ok(OpOutput::result(json!({ "byteLength": p.byte_length })))
    }

    // -- observability ---------------------------------------------------

    fn op_stats(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: HandlePayload = Self::decode(payload)?;
        let entry = self.entry_mut(p.handle)?;
        let counters = serde_json::to_value(&entry.counters)
            .map_err(|err| WorkerError::new(ErrorKind::Io, err.to_string()))?;
        let remote = match entry.disk.remote_telemetry() {
            Some(telemetry) => serde_json::to_value(&telemetry)
                .map_err(|err| WorkerError::new(ErrorKind::Io, err.to_string()))?,
            None => Value::Null,
        };
        Ok(OpOutput::result(json!({
            "capacityBytes": entry.disk.capacity_bytes(),
            "readOnly": entry.read_only,
            "counters": counters,
            "remote": remote,
        })))
    }

    async fn op_bench(&mut self, payload: Value) -> Result<OpOutput, WorkerError> {
        let p: BenchPayload = Self::decode(payload)?;
        let entry = self.entry_mut(p.handle)?;
        let capacity = entry.disk.capacity_bytes();

        let chunk = p
            .chunk_bytes
            .unwrap_or(BENCH_DEFAULT_CHUNK)
            .clamp(SECTOR_SIZE as u64, RUNTIME_DISK_MAX_IO_BYTES)
            / SECTOR_SIZE as u64
            * SECTOR_SIZE as u64;
        let total = p
            .total_bytes
            .unwrap_or(BENCH_DEFAULT_TOTAL)
            .min(capacity)
            .min(BENCH_MAX_TOTAL)
            / SECTOR_SIZE as u64
            * SECTOR_SIZE as u64;

        let mut buf = vec![0u8; chunk as usize];
        let read_started = Instant::now();
        let mut bytes_read = 0u64;
        let mut offset = 0u64;
        while offset < total {
            let n = (total - offset).min(chunk) as usize;
            entry.disk.read_at(offset, &mut buf[..n]).await?;
            bytes_read += n as u64;
            offset += n as u64;
        }
        let read_ms = read_started.elapsed().as_secs_f64() * 1000.0;

        let write_allowed = p.write && !entry.read_only;
        let mut bytes_written = 0u64;
        let mut write_ms = 0.0f64;
        if write_allowed {
            // Write back the bytes just read, so the benchmark is
            // non-destructive.
            let write_started = Instant::now();
            let mut offset = 0u64;
            while offset < total {
                let n = (total - offset).min(chunk) as usize;
                entry.disk.read_at(offset, &mut buf[..n]).await?;
                entry.disk.write_at(offset, &buf[..n]).await?;
                bytes_written += n as u64;
                offset += n as u64;
            }
            write_ms = write_started.elapsed().as_secs_f64() * 1000.0;
        }

        Ok(OpOutput::result(json!({
            "bytesRead": bytes_read,
            "readMs": read_ms,
            "readMbPerSec": throughput_mb_per_sec(bytes_read, read_ms),
            "bytesWritten": bytes_written,
            "writeMs": write_ms,
            "writeMbPerSec": throughput_mb_per_sec(bytes_written, write_ms),
        })))
    }

    // -- snapshot / restore ----------------------------------------------

    async fn op_prepare_snapshot(&mut self) -> Result<OpOutput, WorkerError> {
        let mut handles: Vec<u64> = self.entries.keys().copied().collect();
        handles.sort_unstable();

        // Every disk is flushed before the topology is captured.
        for handle in &handles {
            let entry = self.entry_mut(*handle)?;
            entry.disk.flush().await?;
        }

        let mut entries = Vec::with_capacity(handles.len());
        for handle in handles {
            let entry = self.entry_mut(handle)?;
            let backend = entry.backend.clone().ok_or_else(|| {
                WorkerError::new(
                    ErrorKind::InvalidConfig,
                    format!("disk handle {handle} has no backend descriptor"),
                )
            })?;
            entries.push(SnapshotEntry {
                handle,
                read_only: entry.read_only,
                sector_size: SECTOR_SIZE as u32,
                capacity_bytes: entry.disk.capacity_bytes(),
                backend,
            });
        }

        let snapshot = WorkerSnapshot {
            next_handle: self.next_handle,
            entries,
        };
        let blob = snapshot.encode()?;
        Ok(OpOutput {
            result: json!({
                "byteLength": blob.len(),
                "entries": snapshot.entries.len(),
            }),
            binary: Some(blob),
        })
    }

    async fn op_restore_from_snapshot(
        &mut self,
        binary: Option<Vec<u8>>,
    ) -> Result<OpOutput, WorkerError> {
        let raw = binary.ok_or_else(|| {
            WorkerError::new(
                ErrorKind::InvalidConfig,
                "restoreFromSnapshot requires a binary payload",
            )
        })?;
        let snapshot = WorkerSnapshot::decode(&raw)?;

        // The current set is torn down first; restore replaces everything.
        for (_, mut entry) in self.entries.drain() {
            if let Err(err) = entry.disk.close().await {
                warn!("close during restore reported {}", err.message);
            }
        }

        let mut opened: Vec<(u64, DiskEntry)> = Vec::with_capacity(snapshot.entries.len());
        for snap in &snapshot.entries {
            let result = self.open_spec(snap.backend.clone()).await.and_then(
                |(disk, _, descriptor)| {
                    if disk.capacity_bytes() != snap.capacity_bytes {
                        return Err(WorkerError::new(
                            ErrorKind::SizeMismatch,
                            format!(
                                "handle {}: backend holds {} bytes, snapshot recorded {}",
                                snap.handle,
                                disk.capacity_bytes(),
                                snap.capacity_bytes
                            ),
                        ));
                    }
                    Ok((disk, descriptor))
                },
            );
            match result {
                Ok((disk, descriptor)) => opened.push((
                    snap.handle,
                    DiskEntry {
                        disk,
                        read_only: snap.read_only,
                        backend: Some(descriptor),
                        counters: IoCounters::default(),
                    },
                )),
                Err(err) => {
                    // Roll back: nothing from a failed restore stays open.
                    for (_, mut entry) in opened {
                        let _ = entry.disk.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let mut max_handle = 0u64;
        let mut handles = Vec::with_capacity(opened.len());
        for (handle, entry) in opened {
            max_handle = max_handle.max(handle);
            handles.push(handle);
            self.entries.insert(handle, entry);
        }
        self.next_handle = snapshot.next_handle.max(max_handle + 1);

        Ok(OpOutput::result(json!({
            "handles": handles,
            "nextHandle": self.next_handle,
        })))
    }
}

/// Validates one sector-level I/O request and returns its byte offset.
fn validate_sector_io(capacity: u64, lba: u64, byte_length: u64) -> Result<u64, WorkerError> {
    if byte_length > RUNTIME_DISK_MAX_IO_BYTES {
        return Err(WorkerError::new(
            ErrorKind::TooLarge,
            format!("{byte_length} bytes exceeds the per-request limit"),
        ));
    }
    if byte_length % SECTOR_SIZE as u64 != 0 {
        return Err(WorkerError::new(
            ErrorKind::Alignment,
            format!("byte length {byte_length} is not a multiple of 512"),
        ));
    }
    if lba > MAX_SAFE_INTEGER {
        return Err(WorkerError::new(
            ErrorKind::Overflow,
            "lba is not a safe integer",
        ));
    }
    let offset = lba
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or_else(|| WorkerError::new(ErrorKind::Overflow, "byte offset overflows u64"))?;
    let end = offset
        .checked_add(byte_length)
        .ok_or_else(|| WorkerError::new(ErrorKind::Overflow, "byte offset overflows u64"))?;
    if end > capacity {
        return Err(WorkerError::new(
            ErrorKind::OutOfRange,
            format!("access at lba {lba} for {byte_length} bytes exceeds capacity {capacity}"),
        ));
    }
    Ok(offset)
}

fn throughput_mb_per_sec(bytes: u64, elapsed_ms: f64) -> f64 {
    if elapsed_ms <= 0.0 {
        return 0.0;
    }
    (bytes as f64 / (1024.0 * 1024.0)) / (elapsed_ms / 1000.0)
}

fn cache_backend_of(spec: CacheBackendSpec) -> StreamingCacheBackend {
    match spec {
        CacheBackendSpec::SparseFile => StreamingCacheBackend::SparseFile,
        CacheBackendSpec::Directory => StreamingCacheBackend::Directory,
    }
}

fn apply_remote_options(
    target: &mut aero_storage::StreamingDiskOptions,
    options: &RemoteDiskOptions,
) {
    if let Some(chunk_size) = options.chunk_size {
        target.chunk_size = chunk_size;
    }
    if let Some(fetches) = options.max_concurrent_fetches {
        target.max_concurrent_fetches = fetches;
    }
    if let Some(retries) = options.max_retries {
        target.max_retries = retries;
    }
    if let Some(delay) = options.retry_base_delay_ms {
        target.retry_base_delay_ms = delay;
    }
    if let Some(read_ahead) = options.read_ahead_chunks {
        target.read_ahead_chunks = read_ahead;
    }
}

/// Cache directory name for a remote disk the caller did not place
/// explicitly: image identity when configured, host + path otherwise.
fn derive_cache_key(url: &Url, image_id: Option<&str>, delivery: DeliveryKind) -> String {
    let delivery = match delivery {
        DeliveryKind::Range => "range",
        DeliveryKind::Chunked => "chunked",
    };
    let identity = match image_id {
        Some(id) => id.to_string(),
        None => format!("{}{}", url.host_str().unwrap_or("image"), url.path()),
    };
    let mut key = String::with_capacity(identity.len() + delivery.len() + 1);
    for ch in identity.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            key.push(ch);
        } else {
            key.push('-');
        }
    }
    key.push('-');
    key.push_str(delivery);
    key
}

fn open_or_create_overlay(
    path: &str,
    base_capacity: u64,
) -> Result<AeroSparseDisk<FileBackend>, WorkerError> {
    if Path::new(path).exists() {
        Ok(AeroSparseDisk::open(FileBackend::open_rw(path)?)?)
    } else {
        let block = OVERLAY_BLOCK_SIZE as u64;
        let overlay_size = base_capacity.div_ceil(block) * block;
        let file = FileBackend::create(path, 0)?;
        Ok(AeroSparseDisk::create(
            file,
            AeroSparseConfig {
                disk_size_bytes: overlay_size,
                block_size_bytes: OVERLAY_BLOCK_SIZE,
            },
        )?)
    }
}
