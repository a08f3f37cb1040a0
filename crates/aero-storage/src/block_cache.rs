use std::num::NonZeroUsize;

use lru::LruCache;

use crate::disk::{check_io_bounds, VirtualDisk};
use crate::error::{DiskError, Result};

#[derive(Debug)]
struct CachedBlock {
    data: Vec<u8>,
    dirty: bool,
}

/// Bounded write-back block cache over any disk.
///
/// Eviction writes dirty blocks back to the inner disk first. If that
/// write-back fails the dirty block stays resident and the triggering
/// operation reports the error, so acknowledged writes are never dropped.
#[derive(Debug)]
pub struct BlockCachedDisk<D> {
    inner: D,
    block_size: usize,
    blocks: LruCache<u64, CachedBlock>,
}

impl<D: VirtualDisk> BlockCachedDisk<D> {
    pub fn new(inner: D, block_size: usize, max_blocks: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(DiskError::InvalidConfig("block size must be non-zero"));
        }
        let max_blocks = NonZeroUsize::new(max_blocks)
            .ok_or(DiskError::InvalidConfig("cache must hold at least one block"))?;
        Ok(Self {
            inner,
            block_size,
            blocks: LruCache::new(max_blocks),
        })
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn block_len(&self, block: u64) -> usize {
        let start = block * self.block_size as u64;
        (self.inner.capacity_bytes() - start).min(self.block_size as u64) as usize
    }

    /// Faults `block` into the cache, evicting the LRU entry if the cache is
    /// full. A dirty victim is written back before being dropped; a failed
    /// write-back leaves the victim resident and aborts the fault.
    fn load_block(&mut self, block: u64) -> Result<()> {
        if self.blocks.contains(&block) {
            return Ok(());
        }

        if self.blocks.len() == self.blocks.cap().get() {
            let victim = self.blocks.peek_lru().map(|(k, _)| *k);
            if let Some(victim) = victim {
                let write_back = self
                    .blocks
                    .peek(&victim)
                    .filter(|entry| entry.dirty)
                    .map(|entry| entry.data.clone());
                if let Some(data) = write_back {
                    self.inner.write_at(victim * self.block_size as u64, &data)?;
                }
                self.blocks.pop(&victim);
            }
        }

        let mut data = vec![0u8; self.block_len(block)];
        self.inner.read_at(block * self.block_size as u64, &mut data)?;
        self.blocks.put(block, CachedBlock { data, dirty: false });
        Ok(())
    }
}

impl<D: VirtualDisk> VirtualDisk for BlockCachedDisk<D> {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn read_at(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        check_io_bounds(self.capacity_bytes(), offset, buf.len())?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let block = offset / self.block_size as u64;
            let within = (offset % self.block_size as u64) as usize;
            let n = (self.block_size - within).min(buf.len() - filled);
            self.load_block(block)?;
            let entry = self
                .blocks
                .get(&block)
                .ok_or_else(|| DiskError::Io("cached block vanished".to_string()))?;
            buf[filled..filled + n].copy_from_slice(&entry.data[within..within + n]);
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }

    fn write_at(&mut self, mut offset: u64, buf: &[u8]) -> Result<()> {
        check_io_bounds(self.capacity_bytes(), offset, buf.len())?;

        let mut written = 0usize;
        while written < buf.len() {
            let block = offset / self.block_size as u64;
            let within = (offset % self.block_size as u64) as usize;
            let n = (self.block_size - within).min(buf.len() - written);
            self.load_block(block)?;
            let entry = self
                .blocks
                .get_mut(&block)
                .ok_or_else(|| DiskError::Io("cached block vanished".to_string()))?;
            entry.data[within..within + n].copy_from_slice(&buf[written..written + n]);
            entry.dirty = true;
            written += n;
            offset += n as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(block, _)| *block)
            .collect();
        dirty.sort_unstable();

        for block in dirty {
            let Some(data) = self.blocks.peek(&block).map(|entry| entry.data.clone()) else {
                continue;
            };
            self.inner.write_at(block * self.block_size as u64, &data)?;
            if let Some(entry) = self.blocks.peek_mut(&block) {
                entry.dirty = false;
            }
        }
        self.inner.flush()
    }
}
