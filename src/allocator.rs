//! Two-level allocator orchestration.
//!
//! The allocator binds the space manager, the slab index, and the per-CPU
//! heaps together:
//!
//! - **Fast path**: a request maps to a size class, and the current CPU's
//!   chain for that class is walked for a slab with room. No shared lock
//!   is touched; the slab's own spinlock covers the block handout.
//! - **Slow path**: when the chain has no room, the central mutex is taken
//!   to carve a fresh extent, wrap it in a slab, and index it; the new
//!   slab is then published onto the CPU's chain.
//! - **Free**: the owning slab is found through the index (shared lock
//!   only), and the block is returned to it. Emptied slabs are retained
//!   on their chain for reuse; extents are only reclaimed at teardown.
//! - **Restore**: rebuilds volatile metadata from externally persisted
//!   `(address, size)` records after a crash, carving extents at exact
//!   offsets as needed.

use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{self, NvmConfig};
use crate::error::{AllocError, AllocResult};
use crate::heap::{self, CpuHeap};
use crate::index::SlabIndex;
use crate::slab::{Slab, SlabStats};
use crate::space::{FreeSegment, SpaceManager};
use crate::stats::{AllocCounters, CounterSnapshot};

/// Slab allocator over a byte-addressable NVM region.
///
/// All metadata lives in DRAM and is volatile; the region's bytes are
/// never written by the allocator. Construction covers
/// `[base, base + size)`, with sizes truncated down to a slab multiple.
pub struct NvmAllocator {
    /// Base address of the NVM region.
    base: NonNull<u8>,
    /// Managed bytes (after truncation).
    managed: u64,
    /// Central mutex: serializes extent acquisition/release and the index
    /// mutations tied to them. Never held across block operations.
    space: Mutex<SpaceManager>,
    /// Offset -> slab map used by `free` and `restore`.
    index: SlabIndex,
    /// One heap per CPU, padded so chain heads never share a cache line.
    cpu_heaps: Box<[CachePadded<CpuHeap>]>,
    /// Operation counters.
    counters: AllocCounters,
}

// Safety: the base pointer is never dereferenced by the allocator itself,
// and all shared metadata is independently synchronized (central mutex,
// index rwlock, per-slab spinlocks, atomic chain heads).
unsafe impl Send for NvmAllocator {}
unsafe impl Sync for NvmAllocator {}

impl NvmAllocator {
    /// Create an allocator over `[base, base + size)` with default
    /// configuration.
    pub fn new(base: *mut u8, size: usize) -> AllocResult<Self> {
        Self::with_config(base, size, NvmConfig::default())
    }

    /// Create an allocator with explicit configuration.
    pub fn with_config(base: *mut u8, size: usize, config: NvmConfig) -> AllocResult<Self> {
        let base = NonNull::new(base).ok_or(AllocError::InvalidArgument)?;
        if config.cpu_heaps == 0 || config.index_capacity == 0 {
            return Err(AllocError::InvalidArgument);
        }

        let space = SpaceManager::new(size as u64, 0)?;
        let managed = space.managed_bytes();
        let cpu_heaps = (0..config.cpu_heaps)
            .map(|_| CachePadded::new(CpuHeap::new()))
            .collect();

        debug!(managed, cpu_heaps = config.cpu_heaps, "allocator created");

        Ok(Self {
            base,
            managed,
            space: Mutex::new(space),
            index: SlabIndex::new(config.index_capacity),
            cpu_heaps,
            counters: AllocCounters::new(),
        })
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The returned address is aligned to the block's size class. Fails
    /// for zero or oversized requests and when the region is exhausted.
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        match self.try_allocate(size) {
            Ok(addr) => {
                self.counters.record_allocation(true);
                Ok(addr)
            }
            Err(error) => {
                self.counters.record_allocation(false);
                debug!(size, %error, "allocation failed");
                Err(error)
            }
        }
    }

    fn try_allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let class_id = config::select_class(size).ok_or(AllocError::InvalidArgument)?;
        let cpu = heap::current_cpu_id(self.cpu_heaps.len());

        // Fast path: first slab on this CPU's chain with room. The
        // full-hint can go momentarily stale, so a slab that filled up
        // between the hint and the alloc is simply skipped.
        for slab in self.cpu_heaps[cpu].chain(class_id).iter() {
            if slab.is_full() {
                continue;
            }
            if let Ok(block_idx) = slab.alloc() {
                return Ok(self.block_addr(slab, block_idx));
            }
        }

        self.allocate_slow(class_id, cpu)
    }

    /// Acquire a fresh extent under the central mutex and serve the
    /// request from it.
    ///
    /// Threads racing on the same chain can each carve an extent; the
    /// extras stay on the chain and serve later requests. The mutex is
    /// never held across a block operation.
    fn allocate_slow(&self, class_id: u8, cpu: usize) -> AllocResult<NonNull<u8>> {
        let mut space = self.space.lock();
        let offset = space.alloc_slab()?;
        let slab = Arc::new(Slab::new(class_id, offset)?);
        if let Err(error) = self.index.insert(offset, Arc::clone(&slab)) {
            space.free_slab(offset);
            return Err(error);
        }
        drop(space);

        self.counters.record_slab_created();
        debug!(class_id, base_offset = offset, "slab created");

        // The slab is indexed but not yet chained, so no other thread can
        // reach it; the first block is taken before publication.
        let block_idx = slab.alloc()?;
        let addr = self.block_addr(&slab, block_idx);
        self.cpu_heaps[cpu].chain(class_id).push(slab);

        Ok(addr)
    }

    /// Return a block to its owning slab.
    ///
    /// Null pointers are ignored. Addresses no slab manages are a no-op
    /// (a caller contract violation): logged and counted, with a debug
    /// assertion in debug builds. The slab is retained even if this was
    /// its last live block.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let Some(nvm_offset) = self.offset_of(ptr) else {
            self.note_unmanaged(ptr);
            return;
        };
        let slab_base = config::slab_base_of(nvm_offset);
        let Some(slab) = self.index.lookup(slab_base) else {
            self.note_unmanaged(ptr);
            return;
        };

        // The index lock is already released here; deferred reclaim
        // guarantees the slab outlives this call.
        let block_idx = ((nvm_offset - slab_base) / slab.block_size() as u64) as u32;
        match slab.free(block_idx) {
            Ok(()) => self.counters.record_free(true),
            Err(error) => {
                self.counters.record_free(false);
                warn!(nvm_offset, %error, "free rejected by owning slab");
            }
        }
    }

    /// Re-establish one block as held, from a persisted allocation record.
    ///
    /// Recovery path, expected to run before regular traffic. If no slab
    /// covers the address, the extent is carved at its exact offset and a
    /// slab of the record's class is built for it; if a slab exists, its
    /// class must match the record. Marking is idempotent, so replayed
    /// records are harmless.
    pub fn restore(&self, ptr: *mut u8, size: usize) -> AllocResult<()> {
        match self.try_restore(ptr, size) {
            Ok(()) => {
                self.counters.record_restore(true);
                Ok(())
            }
            Err(error) => {
                self.counters.record_restore(false);
                warn!(size, %error, "restore record rejected");
                Err(error)
            }
        }
    }

    fn try_restore(&self, ptr: *mut u8, size: usize) -> AllocResult<()> {
        if ptr.is_null() {
            return Err(AllocError::InvalidArgument);
        }
        let class_id = config::select_class(size).ok_or(AllocError::InvalidArgument)?;
        let nvm_offset = self.offset_of(ptr).ok_or(AllocError::Unavailable)?;
        let slab_base = config::slab_base_of(nvm_offset);

        let slab = match self.index.lookup(slab_base) {
            Some(slab) => {
                if slab.class_id() != class_id {
                    return Err(AllocError::Mismatch);
                }
                slab
            }
            None => self.adopt_slab(class_id, slab_base)?,
        };

        let block_idx = ((nvm_offset - slab_base) / slab.block_size() as u64) as u32;
        slab.restore_mark(block_idx)
    }

    /// Carve the extent at `slab_base` and build a slab of `class_id` for
    /// it, rolling back on partial failure.
    fn adopt_slab(&self, class_id: u8, slab_base: u64) -> AllocResult<Arc<Slab>> {
        let mut space = self.space.lock();

        // A concurrent record may have built this slab between the
        // caller's lookup and the lock.
        if let Some(slab) = self.index.lookup(slab_base) {
            if slab.class_id() != class_id {
                return Err(AllocError::Mismatch);
            }
            return Ok(slab);
        }

        space.alloc_at(slab_base)?;
        let slab = Arc::new(Slab::new(class_id, slab_base)?);
        if let Err(error) = self.index.insert(slab_base, Arc::clone(&slab)) {
            space.free_slab(slab_base);
            return Err(error);
        }
        drop(space);

        self.counters.record_slab_created();
        debug!(class_id, base_offset = slab_base, "slab restored");

        // Recovery precedes regular traffic; restored slabs land on CPU
        // 0's chains.
        self.cpu_heaps[0].chain(class_id).push(Arc::clone(&slab));
        Ok(slab)
    }

    #[inline]
    fn block_addr(&self, slab: &Slab, block_idx: u32) -> NonNull<u8> {
        let offset = slab.base_offset() + block_idx as u64 * slab.block_size() as u64;
        // Safety: base is non-null and every indexed slab lies inside the
        // managed range, so the sum cannot wrap.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    /// Translate an address into an offset, if it falls in the region.
    #[inline]
    fn offset_of(&self, ptr: *mut u8) -> Option<u64> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || (addr - base) as u64 >= self.managed {
            return None;
        }
        Some((addr - base) as u64)
    }

    fn note_unmanaged(&self, ptr: *mut u8) {
        self.counters.record_free(false);
        warn!(addr = ?ptr, "free of unmanaged address");
        debug_assert!(false, "free of unmanaged address {ptr:?}");
    }

    /// Base address of the managed region.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Bytes under management.
    pub fn managed_bytes(&self) -> u64 {
        self.managed
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> AllocatorStats {
        let space = self.space.lock();
        AllocatorStats {
            managed_bytes: space.managed_bytes(),
            free_bytes: space.free_bytes(),
            free_segments: space.segment_count(),
            indexed_slabs: self.index.len(),
            counters: self.counters.snapshot(),
        }
    }

    /// Snapshot of the free segments, in address order.
    pub fn free_segments(&self) -> Vec<FreeSegment> {
        self.space.lock().segments()
    }

    /// Occupancy of the slab based at `slab_base`, if one is indexed.
    pub fn slab_stats(&self, slab_base: u64) -> Option<SlabStats> {
        self.index.lookup(slab_base).map(|slab| slab.stats())
    }

    /// Occupancy of every indexed slab.
    pub fn indexed_slabs(&self) -> Vec<SlabStats> {
        self.index
            .slabs()
            .iter()
            .map(|slab| slab.stats())
            .collect()
    }
}

/// Aggregate allocator statistics.
#[derive(Debug, Clone)]
pub struct AllocatorStats {
    /// Bytes under management.
    pub managed_bytes: u64,
    /// Free bytes in the space manager.
    pub free_bytes: u64,
    /// Number of free segments.
    pub free_segments: usize,
    /// Number of indexed slabs.
    pub indexed_slabs: usize,
    /// Operation counters.
    pub counters: CounterSnapshot,
}
