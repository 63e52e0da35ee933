//! Configuration and size-class dispatch for the NVM slab allocator.

/// Slab extent size (2MB, huge-page friendly).
///
/// The NVM region is divided into extents of this size, each slab-aligned
/// on its starting offset.
pub const SLAB_SIZE: usize = 2 * 1024 * 1024;

/// Block sizes managed by the allocator, smallest to largest.
///
/// Each size class is a power of two, so blocks are naturally aligned to
/// their own size within a slab-aligned extent.
pub const BLOCK_CLASSES: &[usize] = &[8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Number of size classes.
pub const NUM_CLASSES: usize = BLOCK_CLASSES.len();

/// Largest request the allocator will serve.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Capacity of each slab's free-block ring buffer.
pub const CACHE_SIZE: usize = 64;

/// Batch size for bitmap <-> ring transfers (refill target and drain
/// low-water mark).
pub const CACHE_BATCH: usize = CACHE_SIZE / 2;

/// Number of per-CPU heaps. CPU ids at or above this are clamped by modulo.
pub const MAX_CPUS: usize = 64;

/// Default slab index capacity. Prime, to spread slab-aligned keys across
/// buckets.
pub const DEFAULT_INDEX_CAPACITY: usize = 101;

/// Find the smallest size class whose block size fits a request.
///
/// Returns `None` for zero-sized and oversized requests; callers reject
/// both before dispatch.
#[inline]
pub fn select_class(size: usize) -> Option<u8> {
    if size == 0 {
        return None;
    }
    match BLOCK_CLASSES.binary_search(&size) {
        Ok(idx) => Some(idx as u8),
        Err(idx) => {
            if idx < BLOCK_CLASSES.len() {
                Some(idx as u8)
            } else {
                None // Too large for any class
            }
        }
    }
}

/// Get the block size for a class ID.
#[inline]
pub fn block_size(class_id: u8) -> Option<usize> {
    BLOCK_CLASSES.get(class_id as usize).copied()
}

/// Get the number of blocks a slab of the given class holds.
#[inline]
pub fn blocks_per_slab(class_id: u8) -> Option<usize> {
    block_size(class_id).map(|bs| SLAB_SIZE / bs)
}

/// Align an NVM offset down to the base of its slab extent.
#[inline]
pub(crate) fn slab_base_of(offset: u64) -> u64 {
    offset & !(SLAB_SIZE as u64 - 1)
}

/// Configuration for an [`NvmAllocator`](crate::NvmAllocator).
///
/// The defaults match the compile-time tunables; construction-time knobs
/// (index capacity, per-CPU heap count) can be adjusted for tests or
/// unusual topologies.
#[derive(Debug, Clone)]
pub struct NvmConfig {
    /// Slab index bucket count. Fixed at construction; never rehashed.
    pub index_capacity: usize,
    /// Number of per-CPU heaps to allocate.
    pub cpu_heaps: usize,
}

impl Default for NvmConfig {
    fn default() -> Self {
        Self {
            index_capacity: DEFAULT_INDEX_CAPACITY,
            cpu_heaps: MAX_CPUS,
        }
    }
}

impl NvmConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slab index capacity (prime numbers spread best).
    pub fn index_capacity(mut self, capacity: usize) -> Self {
        self.index_capacity = capacity;
        self
    }

    /// Set the number of per-CPU heaps.
    pub fn cpu_heaps(mut self, count: usize) -> Self {
        self.cpu_heaps = count;
        self
    }
}
