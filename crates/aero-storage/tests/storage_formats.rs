use aero_storage::{
    detect_format, AeroSparseConfig, AeroSparseDisk, AeroSparseHeader, DiskError, DiskFormat,
    DiskImage, MemBackend, StorageBackend, VirtualDisk, SECTOR_SIZE, SPARSE_HEADER_SIZE,
};

const TABLE_OFFSET: u64 = SPARSE_HEADER_SIZE;

fn make_sparse(disk_size: u64, block_size: u32) -> AeroSparseDisk<MemBackend> {
    AeroSparseDisk::create(
        MemBackend::new(),
        AeroSparseConfig {
            disk_size_bytes: disk_size,
            block_size_bytes: block_size,
        },
    )
    .unwrap()
}

#[test]
fn create_write_read_round_trip() {
    // 1 MiB disk, 4 KiB blocks: first block written, later blocks untouched.
    let mut disk = make_sparse(1_048_576, 4096);
    assert_eq!(disk.capacity_bytes(), 1_048_576);

    let data = vec![0x01u8; 4096];
    disk.write_sectors(0, &data).unwrap();

    let mut back = vec![0u8; 4096];
    disk.read_sectors(0, &mut back).unwrap();
    assert_eq!(back, data);

    let mut untouched = vec![0xFFu8; 4096];
    disk.read_sectors(8, &mut untouched).unwrap();
    assert!(untouched.iter().all(|b| *b == 0));

    assert_eq!(disk.allocated_bytes(), 4096);
    assert!(disk.is_block_allocated(0));
    assert!(!disk.is_block_allocated(1));
}

#[test]
fn create_open_preserves_geometry() {
    let mut disk = make_sparse(64 * 1024, 4096);
    disk.write_at(12_345, &[7, 7, 7]).unwrap();
    disk.flush().unwrap();

    let reopened = AeroSparseDisk::open(disk.into_backend()).unwrap();
    assert_eq!(reopened.capacity_bytes(), 64 * 1024);
    assert_eq!(reopened.header().block_size_bytes, 4096);
    assert_eq!(reopened.header().allocated_blocks, 1);
}

#[test]
fn partial_block_writes_merge_with_existing_data() {
    let mut disk = make_sparse(16 * 1024, 4096);

    disk.write_at(0, &vec![0xAA; 4096]).unwrap();
    disk.write_at(100, &[0x55; 8]).unwrap();

    let mut back = vec![0u8; 4096];
    disk.read_at(0, &mut back).unwrap();
    assert!(back[..100].iter().all(|b| *b == 0xAA));
    assert!(back[100..108].iter().all(|b| *b == 0x55));
    assert!(back[108..].iter().all(|b| *b == 0xAA));
}

#[test]
fn reads_and_writes_spanning_blocks() {
    let mut disk = make_sparse(16 * 1024, 4096);
    let data: Vec<u8> = (0..8192 + 1024).map(|i| (i % 251) as u8).collect();
    disk.write_at(3000, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    disk.read_at(3000, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn sector_helpers_enforce_alignment_and_bounds() {
    let mut disk = make_sparse(16 * 1024, 4096);

    let mut unaligned = vec![0u8; 500];
    let err = disk.read_sectors(0, &mut unaligned).unwrap_err();
    assert!(matches!(err, DiskError::UnalignedAccess { .. }));

    let mut buf = vec![0u8; 1024];
    let err = disk.read_sectors(31, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));

    let err = disk.write_sectors(u64::MAX / 256, &buf).unwrap_err();
    assert!(matches!(err, DiskError::OffsetOverflow));
}

#[test]
fn create_rejects_bad_geometry() {
    for block_size in [0u32, 100, 512 * 3, 256] {
        let err = AeroSparseDisk::create(
            MemBackend::new(),
            AeroSparseConfig {
                disk_size_bytes: 16 * 1024,
                block_size_bytes: block_size,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DiskError::InvalidConfig(_)), "block {block_size}");
    }

    let err = AeroSparseDisk::create(
        MemBackend::new(),
        AeroSparseConfig {
            disk_size_bytes: 4096 + 512,
            block_size_bytes: 4096,
        },
    )
    .unwrap_err();
    assert!(matches!(err, DiskError::InvalidConfig(_)));
}

#[test]
fn create_rejects_absurd_allocation_table_sizes() {
    let table_entries: u64 = (64 * 1024 * 1024 / 8) + 1;
    let err = AeroSparseDisk::create(
        MemBackend::new(),
        AeroSparseConfig {
            disk_size_bytes: table_entries * 512,
            block_size_bytes: 512,
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DiskError::InvalidConfig("aerosparse allocation table too large")
    ));
}

#[test]
fn open_rejects_absurd_allocation_table_sizes() {
    // Reject on the header fields alone, before any table-sized allocation.
    let table_entries: u64 = (64 * 1024 * 1024 / 8) + 1;
    let header = AeroSparseHeader {
        version: 1,
        block_size_bytes: 512,
        disk_size_bytes: table_entries * 512,
        table_entries,
        // Invalid on purpose; the table-size cap must fire first.
        data_offset: 0,
        allocated_blocks: 0,
    };
    let mut backend = MemBackend::with_len(SPARSE_HEADER_SIZE).unwrap();
    backend.write_at(0, &header.encode()).unwrap();

    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::Unsupported("aerosparse allocation table too large")
    ));
}

#[test]
fn open_rejects_truncated_header() {
    let mut backend = MemBackend::with_len(8).unwrap();
    backend.write_at(0, b"AEROSPAR").unwrap();
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("truncated sparse header")
    ));
}

#[test]
fn open_rejects_table_entries_mismatch() {
    let disk = make_sparse(16 * 1024, 4096);
    let mut bad = *disk.header();
    bad.table_entries += 1;

    let mut backend = disk.into_backend();
    backend.write_at(0, &bad.encode()).unwrap();
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::InvalidSparseHeader("unexpected table_entries")
    ));
}

#[test]
fn open_rejects_allocated_blocks_exceeding_table_entries() {
    let disk = make_sparse(16 * 1024, 4096);
    let mut bad = *disk.header();
    bad.allocated_blocks = bad.table_entries + 1;

    let mut backend = disk.into_backend();
    backend.write_at(0, &bad.encode()).unwrap();
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::InvalidSparseHeader("allocated_blocks exceeds table_entries")
    ));
}

#[test]
fn open_rejects_unexpected_data_offset() {
    let disk = make_sparse(16 * 1024, 4096);
    let mut bad = *disk.header();
    bad.data_offset += bad.block_size_u64();

    let mut backend = disk.into_backend();
    backend.write_at(0, &bad.encode()).unwrap();
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::InvalidSparseHeader("unsupported data offset")
    ));
}

/// Stamps one fake allocated entry into the table and grows the file so the
/// per-entry checks (rather than the file-length check) decide the outcome.
fn inject_table_entry(disk: AeroSparseDisk<MemBackend>, entry: u64) -> MemBackend {
    let header = *disk.header();
    let block_size = header.block_size_u64();
    let mut bad = header;
    bad.allocated_blocks = 1;

    let mut backend = disk.into_backend();
    backend.set_len(header.data_offset + block_size).unwrap();
    backend.write_at(0, &bad.encode()).unwrap();
    backend.write_at(TABLE_OFFSET, &entry.to_le_bytes()).unwrap();
    backend
}

#[test]
fn open_rejects_table_entry_before_data_region() {
    let disk = make_sparse(16 * 1024, 4096);
    let backend = inject_table_entry(disk, SECTOR_SIZE as u64);
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("data block offset before data region")
    ));
}

#[test]
fn open_rejects_misaligned_table_entry() {
    let disk = make_sparse(16 * 1024, 4096);
    let data_offset = disk.header().data_offset;
    let backend = inject_table_entry(disk, data_offset + SECTOR_SIZE as u64);
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("misaligned data block offset")
    ));
}

#[test]
fn open_rejects_table_entry_past_eof() {
    let disk = make_sparse(16 * 1024, 4096);
    let header = *disk.header();
    let backend = inject_table_entry(disk, header.data_offset + header.block_size_u64());
    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("data block offset out of bounds")
    ));
}

#[test]
fn open_rejects_duplicate_table_entries() {
    let disk = make_sparse(16 * 1024, 4096);
    let header = *disk.header();
    let block_size = header.block_size_u64();
    let mut bad = header;
    bad.allocated_blocks = 2;

    let mut backend = disk.into_backend();
    backend.set_len(header.data_offset + block_size).unwrap();
    backend.write_at(0, &bad.encode()).unwrap();
    backend
        .write_at(TABLE_OFFSET, &header.data_offset.to_le_bytes())
        .unwrap();
    backend
        .write_at(TABLE_OFFSET + 8, &header.data_offset.to_le_bytes())
        .unwrap();

    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("duplicate data block offset")
    ));
}

#[test]
fn open_rejects_allocated_count_disagreeing_with_table() {
    let disk = make_sparse(16 * 1024, 4096);
    let header = *disk.header();
    let mut bad = header;
    bad.allocated_blocks = 1;

    // Claim one allocated block while the table stays empty.
    let mut backend = disk.into_backend();
    backend
        .set_len(header.data_offset + header.block_size_u64())
        .unwrap();
    backend.write_at(0, &bad.encode()).unwrap();

    let err = AeroSparseDisk::open(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("allocated_blocks does not match allocation table")
    ));
}

#[test]
fn trailing_padding_after_data_region_is_tolerated() {
    let mut disk = make_sparse(16 * 1024, 4096);
    disk.write_at(0, &[1, 2, 3, 4]).unwrap();

    let mut backend = disk.into_backend();
    let len = backend.len().unwrap();
    backend.set_len(len + 8192).unwrap();

    let mut reopened = AeroSparseDisk::open(backend).unwrap();
    let mut back = [0u8; 4];
    reopened.read_at(0, &mut back).unwrap();
    assert_eq!(back, [1, 2, 3, 4]);
}

#[test]
fn detect_format_distinguishes_raw_and_sparse() {
    let sparse = make_sparse(16 * 1024, 4096);
    let mut backend = sparse.into_backend();
    assert_eq!(detect_format(&mut backend).unwrap(), DiskFormat::AeroSparse);

    let mut raw = MemBackend::with_len(16).unwrap();
    assert_eq!(detect_format(&mut raw).unwrap(), DiskFormat::Raw);

    let mut empty = MemBackend::new();
    assert_eq!(detect_format(&mut empty).unwrap(), DiskFormat::Raw);
}

#[test]
fn detect_format_reports_sparse_for_bad_headers_with_plausible_version() {
    // Detection is laxer than validation: the open must fail with a
    // structured error instead of silently treating the file as raw.
    let mut backend = MemBackend::with_len(64).unwrap();
    let mut header = [0u8; 64];
    header[..8].copy_from_slice(b"AEROSPAR");
    header[8..12].copy_from_slice(&1u32.to_le_bytes());
    // block_size_bytes stays zero, which cannot pass open-time validation.
    backend.write_at(0, &header).unwrap();

    assert_eq!(detect_format(&mut backend).unwrap(), DiskFormat::AeroSparse);
    let err = DiskImage::open_auto(backend).unwrap_err();
    assert!(matches!(err, DiskError::InvalidSparseHeader(_)));
}

#[test]
fn detect_format_treats_unknown_version_as_raw() {
    let mut backend = MemBackend::with_len(64).unwrap();
    let mut header = [0u8; 64];
    header[..8].copy_from_slice(b"AEROSPAR");
    header[8..12].copy_from_slice(&9u32.to_le_bytes());
    backend.write_at(0, &header).unwrap();
    assert_eq!(detect_format(&mut backend).unwrap(), DiskFormat::Raw);
}

#[test]
fn detect_format_reports_sparse_for_truncated_magic_only_files() {
    let mut backend = MemBackend::with_len(8).unwrap();
    backend.write_at(0, b"AEROSPAR").unwrap();
    assert_eq!(detect_format(&mut backend).unwrap(), DiskFormat::AeroSparse);

    let err = DiskImage::open_auto(backend).unwrap_err();
    assert!(matches!(
        err,
        DiskError::CorruptSparseImage("truncated sparse header")
    ));
}

#[test]
fn open_auto_dispatches_by_content() {
    let sparse = make_sparse(16 * 1024, 4096);
    let image = DiskImage::open_auto(sparse.into_backend()).unwrap();
    assert_eq!(image.format(), DiskFormat::AeroSparse);

    let image = DiskImage::open_auto(MemBackend::with_len(4096).unwrap()).unwrap();
    assert_eq!(image.format(), DiskFormat::Raw);
    assert_eq!(image.capacity_bytes(), 4096);
}
