use aero_storage::{
    AeroSparseConfig, AeroSparseDisk, MemBackend, StorageBackend as _, VirtualDisk,
};

const BLOCK_SIZE: u32 = 4096;

fn make_disk() -> AeroSparseDisk<MemBackend> {
    AeroSparseDisk::create(
        MemBackend::new(),
        AeroSparseConfig {
            disk_size_bytes: 16 * 1024,
            block_size_bytes: BLOCK_SIZE,
        },
    )
    .unwrap()
}

#[test]
fn zero_write_full_block_does_not_allocate() {
    let mut disk = make_disk();
    let initial_len = disk.header().data_offset;

    disk.write_at(0, &vec![0u8; BLOCK_SIZE as usize]).unwrap();
    assert_eq!(disk.header().allocated_blocks, 0);

    let mut backend = disk.into_backend();
    assert_eq!(backend.len().unwrap(), initial_len);
}

#[test]
fn zero_write_partial_does_not_allocate() {
    let mut disk = make_disk();
    disk.write_at(123, &[0u8; 200]).unwrap();
    assert_eq!(disk.header().allocated_blocks, 0);
}

#[test]
fn mixed_write_allocates_only_non_zero_blocks() {
    let mut disk = make_disk();

    let mut data = vec![0u8; (BLOCK_SIZE as usize) * 2];
    data[BLOCK_SIZE as usize + 17] = 0xAB;
    disk.write_at(0, &data).unwrap();

    assert_eq!(disk.header().allocated_blocks, 1);
    assert!(!disk.is_block_allocated(0));
    assert!(disk.is_block_allocated(1));

    let mut out = vec![0u8; data.len()];
    disk.read_at(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn zero_write_into_allocated_block_overwrites_in_place() {
    let mut disk = make_disk();

    disk.write_at(0, &[1, 2, 3, 4]).unwrap();
    assert_eq!(disk.header().allocated_blocks, 1);

    disk.write_at(0, &[0, 0, 0, 0]).unwrap();
    assert_eq!(disk.header().allocated_blocks, 1);

    let mut out = [0xFFu8; 4];
    disk.read_at(0, &mut out).unwrap();
    assert_eq!(out, [0, 0, 0, 0]);
}

#[test]
fn write_block_always_materializes() {
    // Overlay routing depends on allocation state, so the explicit block
    // writer must not take the zero-elision path.
    let mut disk = make_disk();
    disk.write_block(2, &vec![0u8; BLOCK_SIZE as usize]).unwrap();
    assert!(disk.is_block_allocated(2));
    assert_eq!(disk.header().allocated_blocks, 1);
}

#[test]
fn deallocate_block_returns_it_to_zero_reads() {
    let mut disk = make_disk();
    disk.write_at(0, &[0x5A; 16]).unwrap();
    assert!(disk.is_block_allocated(0));

    disk.deallocate_block(0).unwrap();
    assert!(!disk.is_block_allocated(0));
    assert_eq!(disk.header().allocated_blocks, 0);

    let mut out = [0xFFu8; 16];
    disk.read_at(0, &mut out).unwrap();
    assert!(out.iter().all(|b| *b == 0));

    // The table is authoritative; the reopened image agrees.
    let reopened = AeroSparseDisk::open(disk.into_backend()).unwrap();
    assert_eq!(reopened.header().allocated_blocks, 0);
}
