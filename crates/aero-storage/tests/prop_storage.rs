//! Model-based tests: every disk composition must behave exactly like a flat
//! byte array under arbitrary interleavings of reads, writes and flushes.

use aero_storage::{
    AeroCowDisk, AeroSparseConfig, AeroSparseDisk, BlockCachedDisk, MemBackend, RawDisk,
    VirtualDisk,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

const MAX_CAPACITY_BYTES: u64 = 64 * 1024;
const MAX_OPS_PER_CASE: usize = 40;
const MAX_RW_LEN: usize = 4096;

#[derive(Clone, Debug)]
enum Op {
    Read { offset: u64, len: usize },
    Write { offset: u64, data: Vec<u8> },
    Flush,
}

fn offset_len_strategy(capacity: u64) -> impl Strategy<Value = (u64, usize)> {
    let offset = prop_oneof![
        2 => 0u64..capacity,
        1 => Just(0u64),
        1 => Just(capacity - 1),
        1 => Just(capacity / 2),
    ];
    offset.prop_flat_map(move |offset| {
        let remaining = capacity - offset;
        let max_len = (remaining.min(MAX_RW_LEN as u64)) as usize;
        prop_oneof![
            1 => Just(1usize),
            1 => Just(max_len),
            2 => 1usize..=max_len,
        ]
        .prop_map(move |len| (offset, len))
    })
}

fn op_strategy(capacity: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => offset_len_strategy(capacity).prop_map(|(offset, len)| Op::Read { offset, len }),
        4 => offset_len_strategy(capacity).prop_flat_map(|(offset, len)| {
            prop::collection::vec(any::<u8>(), len)
                .prop_map(move |data| Op::Write { offset, data })
        }),
        1 => Just(Op::Flush),
    ]
}

fn apply_ops<D: VirtualDisk>(disk: &mut D, model: &mut [u8], ops: &[Op]) -> TestCaseResult {
    for op in ops {
        match op {
            Op::Read { offset, len } => {
                let start = *offset as usize;
                let mut buf = vec![0u8; *len];
                disk.read_at(*offset, &mut buf)
                    .map_err(|e| TestCaseError::fail(format!("read_at failed: {e:?}")))?;
                prop_assert_eq!(buf.as_slice(), &model[start..start + *len]);
            }
            Op::Write { offset, data } => {
                let start = *offset as usize;
                disk.write_at(*offset, data)
                    .map_err(|e| TestCaseError::fail(format!("write_at failed: {e:?}")))?;
                model[start..start + data.len()].copy_from_slice(data);
            }
            Op::Flush => {
                disk.flush()
                    .map_err(|e| TestCaseError::fail(format!("flush failed: {e:?}")))?;
            }
        }
    }
    Ok(())
}

fn sector_aligned_capacity() -> impl Strategy<Value = u64> {
    (1u64..=(MAX_CAPACITY_BYTES / 512)).prop_map(|sectors| sectors * 512)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn raw_disk_matches_reference(
        (capacity, ops) in (1u64..=MAX_CAPACITY_BYTES)
            .prop_flat_map(|capacity| (
                Just(capacity),
                prop::collection::vec(op_strategy(capacity), 1..=MAX_OPS_PER_CASE),
            ))
    ) {
        let mut model = vec![0u8; capacity as usize];
        let mut disk = RawDisk::create(MemBackend::new(), capacity).unwrap();
        prop_assert_eq!(disk.capacity_bytes(), capacity);

        apply_ops(&mut disk, &mut model, &ops)?;

        disk.flush().unwrap();
        let backend = disk.into_backend();
        prop_assert_eq!(backend.as_slice(), model.as_slice());
    }

    #[test]
    fn sparse_disk_matches_reference_and_survives_reopen(
        (capacity, ops, reads) in sector_aligned_capacity().prop_flat_map(|capacity| (
            Just(capacity),
            prop::collection::vec(op_strategy(capacity), 1..=MAX_OPS_PER_CASE),
            prop::collection::vec(offset_len_strategy(capacity), 1..=8),
        ))
    ) {
        let mut model = vec![0u8; capacity as usize];
        let mut disk = AeroSparseDisk::create(
            MemBackend::new(),
            AeroSparseConfig {
                disk_size_bytes: capacity,
                block_size_bytes: 4096,
            },
        ).unwrap();

        // Unallocated regions read as zero.
        let mut initial = vec![0xAAu8; (capacity as usize).min(1024)];
        disk.read_at(0, &mut initial).unwrap();
        prop_assert!(initial.iter().all(|&b| b == 0));

        apply_ops(&mut disk, &mut model, &ops)?;
        disk.flush().unwrap();

        let mut reopened = AeroSparseDisk::open(disk.into_backend()).unwrap();
        prop_assert_eq!(reopened.capacity_bytes(), capacity);
        for (offset, len) in reads {
            let start = offset as usize;
            let mut buf = vec![0u8; len];
            reopened.read_at(offset, &mut buf).unwrap();
            prop_assert_eq!(buf.as_slice(), &model[start..start + len]);
        }
    }

    #[test]
    fn cow_disk_matches_reference_and_never_touches_the_base(
        (capacity, base_data, ops) in sector_aligned_capacity().prop_flat_map(|capacity| (
            Just(capacity),
            prop::collection::vec(any::<u8>(), capacity as usize),
            prop::collection::vec(op_strategy(capacity), 1..=MAX_OPS_PER_CASE),
        ))
    ) {
        let base_initial = base_data.clone();
        let mut model = base_data;

        let mut base = RawDisk::create(MemBackend::new(), capacity).unwrap();
        base.write_at(0, &model).unwrap();

        let mut cow = AeroCowDisk::create(base, MemBackend::new(), 4096).unwrap();

        // Reads come from the base before any write.
        let len = (capacity as usize).min(1024);
        let mut buf = vec![0u8; len];
        cow.read_at(0, &mut buf).unwrap();
        prop_assert_eq!(buf.as_slice(), &model[..len]);

        apply_ops(&mut cow, &mut model, &ops)?;
        cow.flush().unwrap();

        let (base, _overlay) = cow.into_parts();
        let backend = base.into_backend();
        prop_assert_eq!(backend.as_slice(), base_initial.as_slice());
    }

    #[test]
    fn block_cached_disk_matches_reference_and_writes_back(
        (capacity, ops) in ((3u64 * 1024)..=MAX_CAPACITY_BYTES)
            .prop_flat_map(|capacity| (
                Just(capacity),
                prop::collection::vec(op_strategy(capacity), 1..=MAX_OPS_PER_CASE),
            ))
    ) {
        const BLOCK_SIZE: usize = 1024;
        const MAX_CACHED_BLOCKS: usize = 2;

        let mut model = vec![0u8; capacity as usize];
        let raw = RawDisk::create(MemBackend::new(), capacity).unwrap();
        let mut cached = BlockCachedDisk::new(raw, BLOCK_SIZE, MAX_CACHED_BLOCKS).unwrap();

        apply_ops(&mut cached, &mut model, &ops)?;

        // Dirty three distinct blocks so at least one eviction write-back runs.
        for (block, pattern) in [(0u64, 0xA1u8), (1, 0xB2), (2, 0xC3)] {
            let offset = block * BLOCK_SIZE as u64;
            let len = 32usize.min((capacity as usize).saturating_sub(offset as usize));
            if len == 0 {
                continue;
            }
            let data = vec![pattern; len];
            cached.write_at(offset, &data).unwrap();
            model[offset as usize..offset as usize + len].copy_from_slice(&data);
        }

        cached.flush().unwrap();
        let backend = cached.into_inner().into_backend();
        prop_assert_eq!(backend.as_slice(), model.as_slice());
    }
}
