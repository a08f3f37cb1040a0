//! Persistent cache metadata (`meta.json`).
//!
//! Metadata is only trusted when its version and identity tuple match what the
//! current remote probe expects; anything else (parse failure, semantic
//! nonsense, oversized file) is treated as "no cache" and forces a clear.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Upper bound on the metadata JSON we are willing to parse.
pub(crate) const MAX_METADATA_BYTES: u64 = 64 * 1024 * 1024;

pub(crate) const METADATA_VERSION: u32 = 1;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheValidators {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// Stable identity of a cached image. URLs are deliberately absent: signed
/// URLs rotate, the image they point at does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheIdentity {
    pub image_id: String,
    pub image_version: String,
    pub delivery_type: &'static str,
    pub cache_backend: &'static str,
    pub chunk_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheMetadata {
    pub version: u32,
    pub image_id: String,
    pub image_version: String,
    pub delivery_type: String,
    pub cache_backend: String,
    pub chunk_size_bytes: u64,
    pub validators: CacheValidators,
    /// Compacted, ascending, non-overlapping byte ranges currently cached,
    /// expressed in unpadded image bytes.
    pub cached_ranges: Vec<ByteRange>,
    pub created_at_ms: u64,
    pub last_accessed_at_ms: u64,
    #[serde(default)]
    pub access_counter: u64,
    /// Per-chunk access stamps driving LRU eviction.
    #[serde(default)]
    pub chunk_access: BTreeMap<u64, u64>,
}

impl CacheMetadata {
    pub fn fresh(identity: &CacheIdentity, validators: CacheValidators) -> Self {
        let now = now_ms();
        Self {
            version: METADATA_VERSION,
            image_id: identity.image_id.clone(),
            image_version: identity.image_version.clone(),
            delivery_type: identity.delivery_type.to_string(),
            cache_backend: identity.cache_backend.to_string(),
            chunk_size_bytes: identity.chunk_size_bytes,
            validators,
            cached_ranges: Vec::new(),
            created_at_ms: now,
            last_accessed_at_ms: now,
            access_counter: 0,
            chunk_access: BTreeMap::new(),
        }
    }

    /// Whether this metadata describes the same cached image the probe
    /// resolved. ETag wins when both sides expose one, Last-Modified is the
    /// fallback, and size plus chunk geometry alone are accepted when the
    /// server exposes no validator.
    pub fn matches(&self, identity: &CacheIdentity, probed: &CacheValidators) -> bool {
        if self.version != METADATA_VERSION
            || self.image_id != identity.image_id
            || self.image_version != identity.image_version
            || self.delivery_type != identity.delivery_type
            || self.cache_backend != identity.cache_backend
            || self.chunk_size_bytes != identity.chunk_size_bytes
            || self.validators.size_bytes != probed.size_bytes
        {
            return false;
        }
        match (&self.validators.etag, &probed.etag) {
            (Some(cached), Some(current)) => return cached == current,
            (None, None) => {}
            _ => return false,
        }
        match (&self.validators.last_modified, &probed.last_modified) {
            (Some(cached), Some(current)) => cached == current,
            (None, None) => true,
            _ => false,
        }
    }

    /// Semantic sanity of the cached-range list against the image geometry.
    pub fn ranges_valid(&self, total_size: u64) -> bool {
        let chunk = self.chunk_size_bytes;
        if chunk == 0 {
            return false;
        }
        let mut previous_end = 0u64;
        for (index, range) in self.cached_ranges.iter().enumerate() {
            if range.end <= range.start || range.end > total_size {
                return false;
            }
            if range.start % chunk != 0 {
                return false;
            }
            // Only the final range may end off a chunk boundary (tail chunk).
            if range.end % chunk != 0 && range.end != total_size {
                return false;
            }
            if index > 0 && range.start <= previous_end {
                return false;
            }
            previous_end = range.end;
        }
        true
    }

    pub fn covers_chunk(&self, chunk: u64) -> bool {
        let start = chunk * self.chunk_size_bytes;
        self.cached_ranges
            .iter()
            .any(|range| range.start <= start && start < range.end)
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cached_ranges
            .iter()
            .map(|range| range.end - range.start)
            .sum()
    }

    pub fn cached_chunks(&self) -> Vec<u64> {
        self.chunk_access.keys().copied().collect()
    }

    /// Records chunk `chunk` as cached and bumps its LRU stamp.
    pub fn insert_chunk(&mut self, chunk: u64, total_size: u64) {
        let start = chunk * self.chunk_size_bytes;
        let end = (start + self.chunk_size_bytes).min(total_size);
        self.merge_range(ByteRange { start, end });
        self.touch_chunk(chunk);
    }

    pub fn touch_chunk(&mut self, chunk: u64) {
        self.access_counter += 1;
        self.last_accessed_at_ms = now_ms();
        self.chunk_access.insert(chunk, self.access_counter);
    }

    pub fn remove_chunk(&mut self, chunk: u64, total_size: u64) {
        let start = chunk * self.chunk_size_bytes;
        let end = (start + self.chunk_size_bytes).min(total_size);
        self.chunk_access.remove(&chunk);

        let mut next = Vec::with_capacity(self.cached_ranges.len() + 1);
        for range in self.cached_ranges.drain(..) {
            if range.end <= start || range.start >= end {
                next.push(range);
                continue;
            }
            if range.start < start {
                next.push(ByteRange {
                    start: range.start,
                    end: start,
                });
            }
            if range.end > end {
                next.push(ByteRange {
                    start: end,
                    end: range.end,
                });
            }
        }
        self.cached_ranges = next;
    }

    /// Least-recently-used cached chunk, if any.
    pub fn lru_chunk(&self) -> Option<u64> {
        self.chunk_access
            .iter()
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(chunk, _)| *chunk)
    }

    fn merge_range(&mut self, new: ByteRange) {
        let mut merged = Vec::with_capacity(self.cached_ranges.len() + 1);
        let mut pending = new;
        let mut placed = false;
        for range in self.cached_ranges.drain(..) {
            if range.end < pending.start {
                merged.push(range);
            } else if range.start > pending.end {
                if !placed {
                    merged.push(pending.clone());
                    placed = true;
                }
                merged.push(range);
            } else {
                pending.start = pending.start.min(range.start);
                pending.end = pending.end.max(range.end);
            }
        }
        if !placed {
            merged.push(pending);
        }
        self.cached_ranges = merged;
    }
}

/// Loads metadata from disk, returning `None` for anything unusable.
pub(crate) fn load_metadata(path: &Path) -> Option<CacheMetadata> {
    let len = std::fs::metadata(path).ok()?.len();
    if len > MAX_METADATA_BYTES {
        return None;
    }
    let raw = std::fs::read(path).ok()?;
    let meta: CacheMetadata = serde_json::from_slice(&raw).ok()?;
    if meta.version != METADATA_VERSION {
        return None;
    }
    Some(meta)
}

/// Atomically persists metadata (write temp, rename over).
pub(crate) fn store_metadata(path: &Path, meta: &CacheMetadata) -> std::io::Result<()> {
    let raw = serde_json::to_vec(meta)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)
}
