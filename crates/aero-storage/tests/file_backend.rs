#![cfg(not(target_arch = "wasm32"))]

use aero_storage::{
    AeroSparseConfig, AeroSparseDisk, DiskError, DiskFormat, DiskImage, FileBackend,
    StdFileBackend, StorageBackend as _, VirtualDisk, SECTOR_SIZE,
};
use tempfile::tempdir;

#[test]
fn file_backend_open_and_read_at() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, b"abcdef").unwrap();

    let mut backend = FileBackend::open_read_only(&path).unwrap();
    assert_eq!(backend.len().unwrap(), 6);

    let mut buf = [0u8; 2];
    backend.read_at(2, &mut buf).unwrap();
    assert_eq!(&buf, b"cd");
}

#[test]
fn file_backend_write_extends_and_zero_fills_gap() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 4).unwrap();
    backend.write_at(6, &[0xAA, 0xBB]).unwrap();
    assert_eq!(backend.len().unwrap(), 8);

    let mut gap = [0xFFu8; 2];
    backend.read_at(4, &mut gap).unwrap();
    assert_eq!(gap, [0, 0]);

    let mut tail = [0u8; 2];
    backend.read_at(6, &mut tail).unwrap();
    assert_eq!(tail, [0xAA, 0xBB]);
}

#[test]
fn file_backend_read_beyond_eof_is_out_of_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 4).unwrap();
    let mut buf = [0u8; 2];
    let err = backend.read_at(3, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));

    let err = backend.read_at(u64::MAX, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OffsetOverflow));
}

#[test]
fn file_backend_read_only_rejects_mutation_but_allows_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 4).unwrap();
    backend.write_at(0, &[1, 2, 3, 4]).unwrap();
    backend.flush().unwrap();

    let mut backend = FileBackend::open_read_only(&path).unwrap();
    backend.flush().unwrap();
    let err = backend.write_at(0, &[9]).unwrap_err();
    assert!(matches!(err, DiskError::NotSupported("read-only backend")));
    let err = backend.set_len(8).unwrap_err();
    assert!(matches!(err, DiskError::NotSupported("read-only backend")));
}

#[test]
fn file_backed_sparse_disk_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.aerospar");

    {
        let backend = FileBackend::create(&path, 0).unwrap();
        let mut disk = AeroSparseDisk::create(
            backend,
            AeroSparseConfig {
                disk_size_bytes: (SECTOR_SIZE * 128) as u64,
                block_size_bytes: 4096,
            },
        )
        .unwrap();
        disk.write_at(123, &[9, 8, 7, 6]).unwrap();
        disk.flush().unwrap();
    }

    let backend = FileBackend::open_rw(&path).unwrap();
    let mut image = DiskImage::open_auto(backend).unwrap();
    assert_eq!(image.format(), DiskFormat::AeroSparse);

    let mut back = [0u8; 4];
    image.read_at(123, &mut back).unwrap();
    assert_eq!(back, [9, 8, 7, 6]);
}

#[test]
fn raw_file_image_round_trips_sectors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let backend = FileBackend::create(&path, (SECTOR_SIZE * 8) as u64).unwrap();
    let mut image = DiskImage::open_auto(backend).unwrap();
    assert_eq!(image.format(), DiskFormat::Raw);

    let sector = vec![0xA5u8; SECTOR_SIZE];
    image.write_sectors(0, &sector).unwrap();
    image.flush().unwrap();

    let backend = FileBackend::open_rw(&path).unwrap();
    let mut image = DiskImage::open_auto(backend).unwrap();
    let mut back = vec![0u8; SECTOR_SIZE];
    image.read_sectors(0, &mut back).unwrap();
    assert_eq!(back, sector);
}

#[test]
fn std_file_backend_round_trips_and_reports_bounds() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);

    backend.set_len(4096).unwrap();
    assert_eq!(backend.len().unwrap(), 4096);

    let data = b"positioned i/o";
    backend.write_at(123, data).unwrap();
    let mut back = vec![0u8; data.len()];
    backend.read_at(123, &mut back).unwrap();
    assert_eq!(back, data);

    let mut buf = [0u8; 200];
    let err = backend.read_at(4000, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[cfg(unix)]
#[test]
fn std_file_backend_does_not_disturb_the_cursor() {
    use std::io::{Seek, SeekFrom, Write as _};

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0u8; 16]).unwrap();
    file.seek(SeekFrom::Start(5)).unwrap();
    let before = file.stream_position().unwrap();

    let mut backend = StdFileBackend::from_file(file);
    let mut buf = [0u8; 4];
    backend.read_at(0, &mut buf).unwrap();
    backend.write_at(8, &[1, 2, 3, 4]).unwrap();
    backend.flush().unwrap();

    let mut file = backend.into_file();
    assert_eq!(file.stream_position().unwrap(), before);
}
