use aero_storage::{
    AeroCowDisk, DiskError, MemBackend, RawDisk, ReadOnlyDisk, VirtualDisk, SECTOR_SIZE,
};

fn filled_base(capacity: u64, fill: u8) -> RawDisk<MemBackend> {
    let mut base = RawDisk::create(MemBackend::new(), capacity).unwrap();
    base.write_at(0, &vec![fill; capacity as usize]).unwrap();
    base
}

#[test]
fn partial_sector_write_merges_with_base_block() {
    // Base: 1 MiB of 0xAA. Overlay block 4096. One 512-byte write must fault
    // the surrounding block from the base and merge.
    let base = filled_base(1 << 20, 0xAA);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

    cow.write_sectors(0, &vec![0x55u8; SECTOR_SIZE]).unwrap();

    let mut block = vec![0u8; 4096];
    cow.read_sectors(0, &mut block).unwrap();
    assert!(block[..SECTOR_SIZE].iter().all(|b| *b == 0x55));
    assert!(block[SECTOR_SIZE..].iter().all(|b| *b == 0xAA));

    let (mut base, _overlay) = cow.into_parts();
    let mut base_block = vec![0u8; 4096];
    base.read_sectors(0, &mut base_block).unwrap();
    assert!(base_block.iter().all(|b| *b == 0xAA));
}

#[test]
fn reads_alternate_between_overlay_and_base() {
    let base = filled_base(16 * 1024, 0x11);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

    // Overwrite only the second overlay block.
    cow.write_at(4096, &vec![0x22u8; 4096]).unwrap();

    let mut out = vec![0u8; 12 * 1024];
    cow.read_at(0, &mut out).unwrap();
    assert!(out[..4096].iter().all(|b| *b == 0x11));
    assert!(out[4096..8192].iter().all(|b| *b == 0x22));
    assert!(out[8192..].iter().all(|b| *b == 0x11));
}

#[test]
fn full_block_writes_skip_the_base_read() {
    let base = filled_base(16 * 1024, 0x77);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

    cow.write_at(0, &vec![0x99u8; 4096]).unwrap();
    let mut out = vec![0u8; 4096];
    cow.read_at(0, &mut out).unwrap();
    assert!(out.iter().all(|b| *b == 0x99));
}

#[test]
fn zero_full_block_write_shadows_the_base() {
    // Unlike a plain sparse disk, the overlay must materialize zero blocks,
    // otherwise reads would fall through to the base's non-zero data.
    let base = filled_base(16 * 1024, 0xEE);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

    cow.write_at(0, &vec![0u8; 4096]).unwrap();
    let mut out = vec![0xFFu8; 4096];
    cow.read_at(0, &mut out).unwrap();
    assert!(out.iter().all(|b| *b == 0));
}

#[test]
fn capacity_not_aligned_to_overlay_block_still_works() {
    // 3 sectors of base under a 4 KiB-block overlay: the overlay rounds up
    // internally, the composite capacity does not.
    let base = filled_base(3 * SECTOR_SIZE as u64, 0x42);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();
    assert_eq!(cow.capacity_bytes(), 3 * SECTOR_SIZE as u64);

    cow.write_sectors(2, &vec![0x43u8; SECTOR_SIZE]).unwrap();

    let mut out = vec![0u8; 3 * SECTOR_SIZE];
    cow.read_sectors(0, &mut out).unwrap();
    assert!(out[..2 * SECTOR_SIZE].iter().all(|b| *b == 0x42));
    assert!(out[2 * SECTOR_SIZE..].iter().all(|b| *b == 0x43));

    let mut past = vec![0u8; SECTOR_SIZE];
    let err = cow.read_sectors(3, &mut past).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[test]
fn overlay_persists_across_reattach() {
    let base = filled_base(16 * 1024, 0x10);
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();
    cow.write_at(100, &[0xAB; 8]).unwrap();
    cow.flush().unwrap();

    let (base, overlay) = cow.into_parts();
    let mut cow = AeroCowDisk::open(base, overlay.into_backend()).unwrap();

    let mut out = [0u8; 8];
    cow.read_at(100, &mut out).unwrap();
    assert_eq!(out, [0xAB; 8]);
}

#[test]
fn read_only_base_is_never_written() {
    let base = ReadOnlyDisk::new(filled_base(16 * 1024, 0x33));
    let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

    // Partial and full writes both land in the overlay only; a write reaching
    // the base would fail NotSupported.
    cow.write_at(100, &[1, 2, 3]).unwrap();
    cow.write_at(4096, &vec![9u8; 4096]).unwrap();

    let mut out = [0u8; 3];
    cow.read_at(100, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3]);
}
