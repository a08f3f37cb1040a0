//! Wire protocol of the runtime disk worker.
//!
//! Inbound messages are structured records
//! `{type:"request", requestId, op, payload}` with an optional binary payload
//! and an optional shared-buffer reference riding alongside. Messages may
//! cross a security boundary, so fields are read by explicit key only and
//! decoded into typed payload structs before any work happens; inherited or
//! unexpected properties are never consulted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use aero_storage::{ChunkedStreamingDiskError, DiskError, StreamingDiskError};

/// Upper limit on a single read/write request.
pub const RUNTIME_DISK_MAX_IO_BYTES: u64 = 16 * 1024 * 1024;

/// Largest integer exactly representable by the peers' number type.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Stable error kinds; `name()` is the identifier surfaced in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Alignment,
    OutOfRange,
    ReadOnly,
    NotFound,
    Closed,
    Corrupt,
    Overflow,
    Io,
    UnsupportedServer,
    ValidatorMismatch,
    SizeMismatch,
    InvalidConfig,
    TooLarge,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Alignment => "Alignment",
            ErrorKind::OutOfRange => "OutOfRange",
            ErrorKind::ReadOnly => "ReadOnly",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Closed => "Closed",
            ErrorKind::Corrupt => "Corrupt",
            ErrorKind::Overflow => "Overflow",
            ErrorKind::Io => "IO",
            ErrorKind::UnsupportedServer => "UnsupportedServer",
            ErrorKind::ValidatorMismatch => "ValidatorMismatch",
            ErrorKind::SizeMismatch => "SizeMismatch",
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::TooLarge => "TooLarge",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WorkerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<DiskError> for WorkerError {
    fn from(err: DiskError) -> Self {
        let kind = match &err {
            DiskError::OutOfBounds { .. } => ErrorKind::OutOfRange,
            DiskError::UnalignedAccess { .. } => ErrorKind::Alignment,
            DiskError::OffsetOverflow => ErrorKind::Overflow,
            DiskError::NotSupported(reason) if reason.contains("read-only") => ErrorKind::ReadOnly,
            DiskError::NotSupported(_) => ErrorKind::InvalidConfig,
            DiskError::Closed => ErrorKind::Closed,
            DiskError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DiskError::Unsupported(_) => ErrorKind::InvalidConfig,
            DiskError::CorruptImage(_)
            | DiskError::InvalidSparseHeader(_)
            | DiskError::CorruptSparseImage(_) => ErrorKind::Corrupt,
            DiskError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DiskError::Io(_) => ErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<StreamingDiskError> for WorkerError {
    fn from(err: StreamingDiskError) -> Self {
        let kind = match &err {
            StreamingDiskError::Http(_) | StreamingDiskError::HttpStatus { .. } => ErrorKind::Io,
            StreamingDiskError::Protocol(_) | StreamingDiskError::RangeNotSupported => {
                ErrorKind::UnsupportedServer
            }
            StreamingDiskError::ValidatorMismatch { .. } => ErrorKind::ValidatorMismatch,
            StreamingDiskError::Integrity { .. } => ErrorKind::Corrupt,
            StreamingDiskError::Disk(disk) => return Self::from_disk_with(disk, &err),
            StreamingDiskError::Closed => ErrorKind::Closed,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ChunkedStreamingDiskError> for WorkerError {
    fn from(err: ChunkedStreamingDiskError) -> Self {
        let kind = match &err {
            ChunkedStreamingDiskError::Http(_) | ChunkedStreamingDiskError::HttpStatus { .. } => {
                ErrorKind::Io
            }
            ChunkedStreamingDiskError::Protocol(_) => ErrorKind::UnsupportedServer,
            ChunkedStreamingDiskError::ValidatorMismatch { .. } => ErrorKind::ValidatorMismatch,
            ChunkedStreamingDiskError::Integrity { .. } => ErrorKind::Corrupt,
            ChunkedStreamingDiskError::Disk(disk) => return Self::from_disk_with(disk, &err),
            ChunkedStreamingDiskError::Closed => ErrorKind::Closed,
        };
        Self::new(kind, err.to_string())
    }
}

impl WorkerError {
    fn from_disk_with(disk: &DiskError, outer: &dyn std::fmt::Display) -> Self {
        let kind = match disk {
            DiskError::OutOfBounds { .. } => ErrorKind::OutOfRange,
            DiskError::UnalignedAccess { .. } => ErrorKind::Alignment,
            DiskError::OffsetOverflow => ErrorKind::Overflow,
            DiskError::Closed => ErrorKind::Closed,
            DiskError::CorruptImage(_)
            | DiskError::InvalidSparseHeader(_)
            | DiskError::CorruptSparseImage(_) => ErrorKind::Corrupt,
            DiskError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            _ => ErrorKind::Io,
        };
        Self::new(kind, outer.to_string())
    }
}

/// Accepted request envelope.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub op: String,
    pub payload: Value,
}

/// Parses an inbound envelope. `None` means the message is malformed beyond
/// the point of addressing a response to it; such messages are dropped.
pub fn parse_envelope(value: &Value) -> Option<RequestEnvelope> {
    let map = value.as_object()?;
    if map.get("type")?.as_str()? != "request" {
        return None;
    }
    let request_id = map.get("requestId")?.as_u64()?;
    if request_id > MAX_SAFE_INTEGER {
        return None;
    }
    let op = map.get("op")?.as_str()?;
    if op.is_empty() {
        return None;
    }
    Some(RequestEnvelope {
        request_id,
        op: op.to_string(),
        payload: map.get("payload").cloned().unwrap_or(Value::Null),
    })
}

pub fn ok_response(request_id: u64, result: Value) -> Value {
    json!({
        "type": "response",
        "requestId": request_id,
        "ok": true,
        "result": result,
    })
}

pub fn error_response(request_id: u64, err: &WorkerError) -> Value {
    json!({
        "type": "response",
        "requestId": request_id,
        "ok": false,
        "error": {
            "message": err.message,
            "name": err.kind.name(),
        },
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocalFormatSpec {
    #[default]
    Auto,
    Raw,
    Aerospar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryKind {
    Range,
    Chunked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheBackendSpec {
    #[default]
    SparseFile,
    Directory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteDiskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_fetches: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ahead_chunks: Option<usize>,
}

/// How to open (and later reconstruct) a disk. Also the backend descriptor
/// embedded in snapshots; remote URLs are stored with their query stripped so
/// signed tokens never land in a snapshot blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiskOpenSpec {
    #[serde(rename_all = "camelCase")]
    Local {
        path: String,
        #[serde(default)]
        format: LocalFormatSpec,
        #[serde(default)]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay_path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Remote {
        delivery: DeliveryKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_dir: Option<String>,
        #[serde(default)]
        cache_backend: CacheBackendSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_limit_bytes: Option<u64>,
        #[serde(default)]
        options: RemoteDiskOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay_path: Option<String>,
    },
}

// Typed payloads for the individual ops; decoded via serde so only explicitly
// named fields are ever read.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlePayload {
    pub handle: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub handle: u64,
    pub lba: u64,
    pub byte_length: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadIntoPayload {
    pub handle: u64,
    pub lba: u64,
    pub byte_length: u64,
    pub buffer_offset: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePayload {
    pub handle: u64,
    pub lba: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFromPayload {
    pub handle: u64,
    pub lba: u64,
    pub byte_length: u64,
    pub buffer_offset: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchPayload {
    pub handle: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub chunk_bytes: Option<u64>,
    #[serde(default)]
    pub write: bool,
}

/// Back-compat payload of `openRemote` / `openChunked`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRemotePayload {
    pub url: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub image_version: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub cache_backend: CacheBackendSpec,
    #[serde(default)]
    pub cache_limit_bytes: Option<u64>,
    #[serde(default)]
    pub options: RemoteDiskOptions,
    #[serde(default)]
    pub overlay_path: Option<String>,
}
