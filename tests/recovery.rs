//! Recovery-path tests: rebuilding allocator metadata from persisted
//! `(address, size)` records.

use nvm_slab::{AllocError, MappedRegion, NvmAllocator, NvmConfig, SLAB_SIZE};

const SLAB: u64 = SLAB_SIZE as u64;

fn setup(slabs: usize) -> (MappedRegion, NvmAllocator) {
    let region = MappedRegion::anonymous(slabs * SLAB_SIZE).expect("mmap failed");
    let allocator =
        NvmAllocator::with_config(region.as_ptr(), region.len(), NvmConfig::new().cpu_heaps(1))
            .expect("create failed");
    (region, allocator)
}

unsafe fn at(region: &MappedRegion, offset: u64) -> *mut u8 {
    unsafe { region.as_ptr().add(offset as usize) }
}

#[test]
fn test_restore_builds_slab_and_carves_space() {
    let (region, allocator) = setup(10);

    // A 60-byte record at offset 2*SLAB + 64: block 1 of a 64-byte-class
    // slab based at 2*SLAB.
    let ptr = unsafe { at(&region, 2 * SLAB + 64) };
    allocator.restore(ptr, 60).expect("restore failed");

    let slab = allocator.slab_stats(2 * SLAB).expect("slab not indexed");
    assert_eq!(slab.block_size, 64);
    assert_eq!(slab.allocated, 1);
    assert_eq!(slab.reserved, 1);

    // The extent was carved out of the middle of the free space.
    let segments = allocator.free_segments();
    assert_eq!(segments.len(), 2);
    assert_eq!((segments[0].offset, segments[0].size), (0, 2 * SLAB));
    assert_eq!((segments[1].offset, segments[1].size), (3 * SLAB, 7 * SLAB));
}

#[test]
fn test_restore_second_record_reuses_slab() {
    let (region, allocator) = setup(10);

    allocator.restore(region.as_ptr(), 32).expect("first restore failed");
    let ptr = unsafe { at(&region, 128) };
    allocator.restore(ptr, 32).expect("second restore failed");

    let slab = allocator.slab_stats(0).expect("slab not indexed");
    assert_eq!(slab.block_size, 32);
    assert_eq!(slab.allocated, 2);
    assert_eq!(allocator.stats().indexed_slabs, 1);
}

#[test]
fn test_restore_at_head_of_space() {
    let (region, allocator) = setup(10);

    allocator.restore(region.as_ptr(), 16).expect("restore failed");

    let segments = allocator.free_segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].offset, SLAB);
    assert_eq!(segments[0].size, 9 * SLAB);
}

#[test]
fn test_restore_at_tail_of_space() {
    let (region, allocator) = setup(10);

    let ptr = unsafe { at(&region, 9 * SLAB) };
    allocator.restore(ptr, 16).expect("restore failed");

    let segments = allocator.free_segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].offset, 0);
    assert_eq!(segments[0].size, 9 * SLAB);
}

#[test]
fn test_restore_is_idempotent() {
    let (region, allocator) = setup(10);
    let ptr = unsafe { at(&region, 256) };

    allocator.restore(ptr, 100).expect("restore failed");
    allocator.restore(ptr, 100).expect("replayed restore failed");

    // The replayed record changed nothing.
    let slab = allocator.slab_stats(0).expect("slab not indexed");
    assert_eq!(slab.allocated, 1);
    assert_eq!(slab.block_size, 128);
    assert_eq!(allocator.stats().counters.restores, 2);
}

#[test]
fn test_restore_class_mismatch_is_fatal_for_record() {
    let (region, allocator) = setup(10);

    allocator.restore(region.as_ptr(), 32).expect("restore failed");

    // A 4096-byte record targeting the same extent contradicts the
    // existing slab's class.
    let ptr = unsafe { at(&region, 4096) };
    assert_eq!(allocator.restore(ptr, 4096).err(), Some(AllocError::Mismatch));

    // The slab and its first record are untouched.
    let slab = allocator.slab_stats(0).expect("slab dropped");
    assert_eq!(slab.block_size, 32);
    assert_eq!(slab.allocated, 1);
}

#[test]
fn test_restore_rejects_invalid_records() {
    let (region, allocator) = setup(4);

    assert_eq!(
        allocator.restore(std::ptr::null_mut(), 64).err(),
        Some(AllocError::InvalidArgument)
    );
    assert_eq!(
        allocator.restore(region.as_ptr(), 0).err(),
        Some(AllocError::InvalidArgument)
    );
    assert_eq!(
        allocator.restore(region.as_ptr(), 4097).err(),
        Some(AllocError::InvalidArgument)
    );

    // Outside the managed range entirely.
    let beyond = unsafe { at(&region, 4 * SLAB) };
    assert_eq!(
        allocator.restore(beyond, 64).err(),
        Some(AllocError::Unavailable)
    );

    // Nothing was built along the way.
    assert_eq!(allocator.stats().indexed_slabs, 0);
    assert_eq!(allocator.stats().free_bytes, 4 * SLAB);
}

#[test]
fn test_restored_slab_serves_new_allocations() {
    let (region, allocator) = setup(10);

    // Restore block 0 of a 64-byte-class slab, then allocate from it: the
    // restored block must be skipped.
    allocator.restore(region.as_ptr(), 64).expect("restore failed");

    let addr = allocator.allocate(64).expect("allocate failed");
    assert_ne!(addr.as_ptr(), region.as_ptr(), "restored block handed out");

    let slab = allocator.slab_stats(0).expect("slab not indexed");
    assert_eq!(slab.allocated, 2);
    assert_eq!(allocator.stats().indexed_slabs, 1);
}

#[test]
fn test_mixed_replay_then_traffic() {
    let (region, allocator) = setup(10);

    // Replay a scattered log across three extents and two classes.
    let records: &[(u64, usize)] = &[
        (0, 8),
        (64, 8),
        (3 * SLAB + 1024, 1024),
        (3 * SLAB + 4096, 1024),
        (7 * SLAB + 16, 8),
        (0, 8), // duplicate record, replayed
    ];
    for &(offset, size) in records {
        let ptr = unsafe { at(&region, offset) };
        allocator.restore(ptr, size).expect("restore failed");
    }

    let stats = allocator.stats();
    assert_eq!(stats.indexed_slabs, 3);
    assert_eq!(stats.free_bytes, 7 * SLAB);

    // Regular traffic continues on top of the rebuilt state.
    let addr = allocator.allocate(8).expect("allocate failed");
    allocator.free(addr.as_ptr());

    for slab in allocator.indexed_slabs() {
        assert_eq!(slab.reserved, slab.allocated + slab.cached);
    }
}
