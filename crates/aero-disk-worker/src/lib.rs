//! Runtime disk worker: a message-driven manager of open virtual disks.
//!
//! The worker owns a set of disk handles (local images, copy-on-write
//! compositions, remote streaming disks), serializes every request through a
//! FIFO inbox, performs sector-aligned validated I/O against plain or shared
//! buffers, and can snapshot and restore its whole open-disk topology.

mod protocol;
mod runtime_disk;
mod shared;
mod snapshot;
mod worker;

pub use protocol::{
    error_response, ok_response, parse_envelope, CacheBackendSpec, DeliveryKind, DiskOpenSpec,
    ErrorKind, LocalFormatSpec, RemoteDiskOptions, RequestEnvelope, WorkerError, MAX_SAFE_INTEGER,
    RUNTIME_DISK_MAX_IO_BYTES,
};
pub use runtime_disk::{
    LocalDisk, LocalRuntimeDisk, RemoteBase, RemoteOverlayDisk, RemoteRuntimeDisk, RuntimeDisk,
};
pub use shared::SharedBuffer;
pub use snapshot::{SnapshotEntry, WorkerSnapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use worker::{
    spawn_disk_worker, DiskWorkerHandle, DiskWorkerOptions, IoCounters, WorkerMessage,
    WorkerResponse,
};
