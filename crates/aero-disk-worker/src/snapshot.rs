//! Binary snapshot of the worker's open-disk topology.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "AERODSNP" | u32 version | u64 next_handle | u32 entry_count
//! per entry: u64 handle | u8 read_only | u32 sector_size | u64 capacity
//!          | u32 descriptor_len | descriptor (JSON DiskOpenSpec)
//! ```
//!
//! Entries are emitted in ascending handle order. Descriptors carry stable
//! identifiers only; remote URLs are stored query-stripped.

use crate::protocol::{DiskOpenSpec, ErrorKind, WorkerError};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"AERODSNP";
pub const SNAPSHOT_VERSION: u32 = 1;

const MAX_SNAPSHOT_ENTRIES: u32 = 1_000_000;
const MAX_DESCRIPTOR_BYTES: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub handle: u64,
    pub read_only: bool,
    pub sector_size: u32,
    pub capacity_bytes: u64,
    pub backend: DiskOpenSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub next_handle: u64,
    pub entries: Vec<SnapshotEntry>,
}

impl WorkerSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, WorkerError> {
        let mut out = Vec::with_capacity(64 + self.entries.len() * 96);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.next_handle.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for entry in &self.entries {
            let descriptor = serde_json::to_vec(&entry.backend).map_err(|err| {
                WorkerError::new(
                    ErrorKind::Io,
                    format!("failed to encode backend descriptor: {err}"),
                )
            })?;
            if descriptor.len() as u32 > MAX_DESCRIPTOR_BYTES {
                return Err(WorkerError::new(
                    ErrorKind::TooLarge,
                    "backend descriptor exceeds the size limit",
                ));
            }
            out.extend_from_slice(&entry.handle.to_le_bytes());
            out.push(entry.read_only as u8);
            out.extend_from_slice(&entry.sector_size.to_le_bytes());
            out.extend_from_slice(&entry.capacity_bytes.to_le_bytes());
            out.extend_from_slice(&(descriptor.len() as u32).to_le_bytes());
            out.extend_from_slice(&descriptor);
        }
        Ok(out)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WorkerError> {
        let mut cursor = Cursor::new(raw);
        let magic = cursor.take(8)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt("bad snapshot magic"));
        }
        let version = cursor.u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(corrupt("unsupported snapshot version"));
        }
        let next_handle = cursor.u64()?;
        let count = cursor.u32()?;
        if count > MAX_SNAPSHOT_ENTRIES {
            return Err(corrupt("snapshot entry count out of range"));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut previous_handle = None;
        for _ in 0..count {
            let handle = cursor.u64()?;
            if previous_handle.is_some_and(|previous| handle <= previous) {
                return Err(corrupt("snapshot handles out of order"));
            }
            previous_handle = Some(handle);

            let read_only = match cursor.u8()? {
                0 => false,
                1 => true,
                _ => return Err(corrupt("bad read_only flag")),
            };
            let sector_size = cursor.u32()?;
            let capacity_bytes = cursor.u64()?;
            let descriptor_len = cursor.u32()?;
            if descriptor_len > MAX_DESCRIPTOR_BYTES {
                return Err(corrupt("backend descriptor exceeds the size limit"));
            }
            let descriptor = cursor.take(descriptor_len as usize)?;
            let backend: DiskOpenSpec = serde_json::from_slice(descriptor)
                .map_err(|_| corrupt("unparseable backend descriptor"))?;

            entries.push(SnapshotEntry {
                handle,
                read_only,
                sector_size,
                capacity_bytes,
                backend,
            });
        }

        if !cursor.at_end() {
            return Err(corrupt("trailing bytes after snapshot entries"));
        }
        Ok(Self {
            next_handle,
            entries,
        })
    }
}

fn corrupt(message: &'static str) -> WorkerError {
    WorkerError::new(ErrorKind::Corrupt, message)
}

struct Cursor<'a> {
    raw: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, position: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WorkerError> {
        let end = self
            .position
            .checked_add(len)
            .ok_or_else(|| corrupt("snapshot length overflow"))?;
        if end > self.raw.len() {
            return Err(corrupt("truncated snapshot"));
        }
        let slice = &self.raw[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WorkerError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WorkerError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    fn u64(&mut self) -> Result<u64, WorkerError> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }

    fn at_end(&self) -> bool {
        self.position == self.raw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalFormatSpec;

    fn sample() -> WorkerSnapshot {
        WorkerSnapshot {
            next_handle: 7,
            entries: vec![
                SnapshotEntry {
                    handle: 2,
                    read_only: true,
                    sector_size: 512,
                    capacity_bytes: 1 << 20,
                    backend: DiskOpenSpec::Local {
                        path: "/images/base.aerospar".to_string(),
                        format: LocalFormatSpec::Aerospar,
                        read_only: true,
                        overlay_path: None,
                    },
                },
                SnapshotEntry {
                    handle: 5,
                    read_only: false,
                    sector_size: 512,
                    capacity_bytes: 4 << 20,
                    backend: DiskOpenSpec::Local {
                        path: "/images/data.img".to_string(),
                        format: LocalFormatSpec::Raw,
                        read_only: false,
                        overlay_path: Some("/images/data.overlay".to_string()),
                    },
                },
            ],
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = sample();
        let raw = snapshot.encode().unwrap();
        assert_eq!(&raw[..8], SNAPSHOT_MAGIC);
        let back = WorkerSnapshot::decode(&raw).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_garbage() {
        let raw = sample().encode().unwrap();

        let err = WorkerSnapshot::decode(&raw[..raw.len() - 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);

        let mut extended = raw.clone();
        extended.push(0);
        let err = WorkerSnapshot::decode(&extended).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn decode_rejects_unordered_handles() {
        let mut snapshot = sample();
        snapshot.entries.swap(0, 1);
        let raw = snapshot.encode().unwrap();
        let err = WorkerSnapshot::decode(&raw).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut raw = sample().encode().unwrap();
        raw[0] ^= 0xFF;
        let err = WorkerSnapshot::decode(&raw).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }
}
