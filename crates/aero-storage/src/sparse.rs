use std::collections::HashSet;

use crate::backend::StorageBackend;
use crate::disk::{check_io_bounds, VirtualDisk, SECTOR_SIZE};
use crate::error::{DiskError, Result};

pub const AEROSPAR_MAGIC: &[u8; 8] = b"AEROSPAR";
pub const SPARSE_HEADER_SIZE: u64 = 64;

/// Hard cap on the allocation table read performed at open time. A header
/// claiming more than this is rejected before any allocation happens.
pub const MAX_ALLOCATION_TABLE_BYTES: u64 = 64 * 1024 * 1024;

const TABLE_OFFSET: u64 = SPARSE_HEADER_SIZE;
const TABLE_ENTRY_SIZE: u64 = 8;
const ALLOCATED_BLOCKS_FIELD_OFFSET: u64 = 56;

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// On-disk aero-sparse header. All integers little-endian; the magic is raw
/// ASCII, not null-terminated. `flags` and the reserved fields are written as
/// zero and ignored on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeroSparseHeader {
    pub version: u32,
    pub block_size_bytes: u32,
    pub disk_size_bytes: u64,
    pub table_entries: u64,
    pub data_offset: u64,
    pub allocated_blocks: u64,
}

impl AeroSparseHeader {
    pub fn encode(&self) -> [u8; 64] {
        let mut raw = [0u8; 64];
        raw[0..8].copy_from_slice(AEROSPAR_MAGIC);
        raw[8..12].copy_from_slice(&self.version.to_le_bytes());
        // raw[12..16] flags, raw[20..24] and raw[32..40] reserved: zero.
        raw[16..20].copy_from_slice(&self.block_size_bytes.to_le_bytes());
        raw[24..32].copy_from_slice(&self.disk_size_bytes.to_le_bytes());
        raw[40..48].copy_from_slice(&self.table_entries.to_le_bytes());
        raw[48..56].copy_from_slice(&self.data_offset.to_le_bytes());
        raw[56..64].copy_from_slice(&self.allocated_blocks.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8; 64]) -> Result<Self> {
        if &raw[0..8] != AEROSPAR_MAGIC {
            return Err(DiskError::InvalidSparseHeader("bad magic"));
        }
        Ok(Self {
            version: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            block_size_bytes: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            disk_size_bytes: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            table_entries: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
            data_offset: u64::from_le_bytes(raw[48..56].try_into().unwrap()),
            allocated_blocks: u64::from_le_bytes(raw[56..64].try_into().unwrap()),
        })
    }

    pub fn block_size_u64(&self) -> u64 {
        self.block_size_bytes as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AeroSparseConfig {
    pub disk_size_bytes: u64,
    pub block_size_bytes: u32,
}

fn valid_block_size(block_size: u32) -> bool {
    block_size as usize >= SECTOR_SIZE
        && block_size as usize % SECTOR_SIZE == 0
        && block_size.is_power_of_two()
}

/// Self-describing fixed-block sparse image: 64-byte header, dense allocation
/// table, then an append-only block arena.
///
/// The allocation table is authoritative. Replaced or evicted block slots may
/// leave garbage in the arena and the file may be longer than strictly
/// required; both are tolerated on open.
#[derive(Debug)]
pub struct AeroSparseDisk<B> {
    backend: B,
    header: AeroSparseHeader,
    table: Vec<u64>,
    /// Next append position for a freshly allocated block.
    end_offset: u64,
}

impl<B: StorageBackend> AeroSparseDisk<B> {
    pub fn create(mut backend: B, config: AeroSparseConfig) -> Result<Self> {
        if !valid_block_size(config.block_size_bytes) {
            return Err(DiskError::InvalidConfig(
                "block size must be a power-of-two multiple of 512",
            ));
        }
        let block_size = config.block_size_bytes as u64;
        if config.disk_size_bytes == 0 || config.disk_size_bytes % block_size != 0 {
            return Err(DiskError::InvalidConfig(
                "disk size must be a non-zero multiple of the block size",
            ));
        }

        let table_entries = config.disk_size_bytes / block_size;
        let table_bytes = table_entries
            .checked_mul(TABLE_ENTRY_SIZE)
            .ok_or(DiskError::OffsetOverflow)?;
        if table_bytes > MAX_ALLOCATION_TABLE_BYTES {
            return Err(DiskError::InvalidConfig(
                "aerosparse allocation table too large",
            ));
        }

        let data_offset = align_up(SPARSE_HEADER_SIZE + table_bytes, block_size);
        let header = AeroSparseHeader {
            version: 1,
            block_size_bytes: config.block_size_bytes,
            disk_size_bytes: config.disk_size_bytes,
            table_entries,
            data_offset,
            allocated_blocks: 0,
        };

        // Zero header + table region, then stamp the header and sync.
        backend.set_len(0)?;
        backend.set_len(data_offset)?;
        backend.write_at(0, &header.encode())?;
        backend.flush()?;

        let table = vec![0u64; table_entries as usize];
        Ok(Self {
            backend,
            header,
            table,
            end_offset: data_offset,
        })
    }

    pub fn open(mut backend: B) -> Result<Self> {
        let file_len = backend.len()?;
        if file_len < SPARSE_HEADER_SIZE {
            return Err(DiskError::CorruptSparseImage("truncated sparse header"));
        }

        let mut raw = [0u8; 64];
        backend.read_at(0, &mut raw)?;
        let header = AeroSparseHeader::decode(&raw)?;

        if header.version != 1 {
            return Err(DiskError::InvalidSparseHeader("unsupported version"));
        }
        if !valid_block_size(header.block_size_bytes) {
            return Err(DiskError::InvalidSparseHeader("invalid block size"));
        }
        let block_size = header.block_size_u64();
        if header.disk_size_bytes == 0 || header.disk_size_bytes % block_size != 0 {
            return Err(DiskError::InvalidSparseHeader("invalid disk size"));
        }
        if header.table_entries != header.disk_size_bytes / block_size {
            return Err(DiskError::InvalidSparseHeader("unexpected table_entries"));
        }
        if header.allocated_blocks > header.table_entries {
            return Err(DiskError::InvalidSparseHeader(
                "allocated_blocks exceeds table_entries",
            ));
        }

        // Bound the table read before anything else touches it.
        let table_bytes = header
            .table_entries
            .checked_mul(TABLE_ENTRY_SIZE)
            .ok_or(DiskError::OffsetOverflow)?;
        if table_bytes > MAX_ALLOCATION_TABLE_BYTES {
            return Err(DiskError::Unsupported("aerosparse allocation table too large"));
        }

        if header.data_offset != align_up(SPARSE_HEADER_SIZE + table_bytes, block_size) {
            return Err(DiskError::InvalidSparseHeader("unsupported data offset"));
        }
        if file_len < header.data_offset {
            return Err(DiskError::CorruptSparseImage("file shorter than data offset"));
        }

        let mut table_raw = vec![0u8; table_bytes as usize];
        backend.read_at(TABLE_OFFSET, &mut table_raw)?;

        let mut table = Vec::with_capacity(header.table_entries as usize);
        let mut seen = HashSet::with_capacity(header.allocated_blocks as usize);
        let mut allocated = 0u64;
        let mut end_offset = header.data_offset;
        for chunk in table_raw.chunks_exact(TABLE_ENTRY_SIZE as usize) {
            let entry = u64::from_le_bytes(chunk.try_into().unwrap());
            if entry != 0 {
                if entry < header.data_offset {
                    return Err(DiskError::CorruptSparseImage(
                        "data block offset before data region",
                    ));
                }
                if entry % block_size != 0 {
                    return Err(DiskError::CorruptSparseImage("misaligned data block offset"));
                }
                let entry_end = entry
                    .checked_add(block_size)
                    .ok_or(DiskError::OffsetOverflow)?;
                if entry_end > file_len {
                    return Err(DiskError::CorruptSparseImage("data block offset out of bounds"));
                }
                if !seen.insert(entry) {
                    return Err(DiskError::CorruptSparseImage("duplicate data block offset"));
                }
                allocated += 1;
                end_offset = end_offset.max(entry_end);
            }
            table.push(entry);
        }

        if allocated != header.allocated_blocks {
            return Err(DiskError::CorruptSparseImage(
                "allocated_blocks does not match allocation table",
            ));
        }

        Ok(Self {
            backend,
            header,
            table,
            end_offset,
        })
    }

    pub fn header(&self) -> &AeroSparseHeader {
        &self.header
    }

    pub fn block_size_bytes(&self) -> u32 {
        self.header.block_size_bytes
    }

    pub fn is_block_allocated(&self, block: u64) -> bool {
        self.table
            .get(block as usize)
            .map(|entry| *entry != 0)
            .unwrap_or(false)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.header.allocated_blocks * self.header.block_size_u64()
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Writes one full block, always materializing it, even when `data` is all
    /// zeros. Overlays rely on allocation state for read routing, so they must
    /// not go through the zero-elision path.
    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size_u64();
        if data.len() as u64 != block_size {
            return Err(DiskError::InvalidConfig("write_block requires one full block"));
        }
        if block >= self.header.table_entries {
            return Err(DiskError::OutOfBounds {
                offset: block * block_size,
                len: data.len(),
                capacity: self.header.disk_size_bytes,
            });
        }
        match self.table[block as usize] {
            0 => self.allocate_block(block, data),
            physical => self.backend.write_at(physical, data),
        }
    }

    /// Drops a block from the allocation table. The arena slot is leaked; the
    /// table stays authoritative.
    pub fn deallocate_block(&mut self, block: u64) -> Result<()> {
        let Some(slot) = self.table.get_mut(block as usize) else {
            return Ok(());
        };
        if *slot == 0 {
            return Ok(());
        }
        *slot = 0;
        self.header.allocated_blocks -= 1;
        let table_pos = TABLE_OFFSET + block * TABLE_ENTRY_SIZE;
        self.backend.write_at(table_pos, &0u64.to_le_bytes())?;
        self.backend.write_at(
            ALLOCATED_BLOCKS_FIELD_OFFSET,
            &self.header.allocated_blocks.to_le_bytes(),
        )
    }

    fn allocate_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size_u64();
        let physical = self.end_offset;
        let new_end = physical
            .checked_add(block_size)
            .ok_or(DiskError::OffsetOverflow)?;

        // Extend and write the data before publishing the table entry so a
        // torn update can never leave an entry pointing past EOF.
        self.backend.set_len(new_end)?;
        self.backend.write_at(physical, data)?;

        let table_pos = TABLE_OFFSET + block * TABLE_ENTRY_SIZE;
        self.backend.write_at(table_pos, &physical.to_le_bytes())?;

        self.table[block as usize] = physical;
        self.header.allocated_blocks += 1;
        self.end_offset = new_end;
        self.backend.write_at(
            ALLOCATED_BLOCKS_FIELD_OFFSET,
            &self.header.allocated_blocks.to_le_bytes(),
        )
    }

    fn read_block_range(&mut self, block: u64, within: u64, buf: &mut [u8]) -> Result<()> {
        match self.table[block as usize] {
            0 => buf.fill(0),
            physical => self.backend.read_at(physical + within, buf)?,
        }
        Ok(())
    }

    fn write_block_range(&mut self, block: u64, within: u64, data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size_u64() as usize;
        match self.table[block as usize] {
            0 => {
                // Unallocated target: writing zeros over an implicit zero block
                // is a no-op, so skip the allocation entirely.
                if data.iter().all(|b| *b == 0) {
                    return Ok(());
                }
                if data.len() == block_size {
                    return self.allocate_block(block, data);
                }
                let mut scratch = vec![0u8; block_size];
                scratch[within as usize..within as usize + data.len()].copy_from_slice(data);
                self.allocate_block(block, &scratch)
            }
            physical => self.backend.write_at(physical + within, data),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for AeroSparseDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.header.disk_size_bytes
    }

    fn read_at(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        check_io_bounds(self.capacity_bytes(), offset, buf.len())?;
        let block_size = self.header.block_size_u64();

        let mut filled = 0usize;
        while filled < buf.len() {
            let block = offset / block_size;
            let within = offset % block_size;
            let n = ((block_size - within) as usize).min(buf.len() - filled);
            self.read_block_range(block, within, &mut buf[filled..filled + n])?;
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }

    fn write_at(&mut self, mut offset: u64, buf: &[u8]) -> Result<()> {
        check_io_bounds(self.capacity_bytes(), offset, buf.len())?;
        let block_size = self.header.block_size_u64();

        let mut written = 0usize;
        while written < buf.len() {
            let block = offset / block_size;
            let within = offset % block_size;
            let n = ((block_size - within) as usize).min(buf.len() - written);
            self.write_block_range(block, within, &buf[written..written + n])?;
            written += n;
            offset += n as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn header_round_trips() {
        let header = AeroSparseHeader {
            version: 1,
            block_size_bytes: 4096,
            disk_size_bytes: 1 << 20,
            table_entries: 256,
            data_offset: 4096,
            allocated_blocks: 3,
        };
        let decoded = AeroSparseHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn data_offset_is_block_aligned() {
        let disk = AeroSparseDisk::create(
            MemBackend::new(),
            AeroSparseConfig {
                disk_size_bytes: 1 << 20,
                block_size_bytes: 4096,
            },
        )
        .unwrap();
        // 64-byte header + 256 * 8 bytes of table = 2112, aligned up to 4096.
        assert_eq!(disk.header().data_offset, 4096);
    }
}
