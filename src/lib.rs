//! Slab allocator for byte-addressable non-volatile memory regions.
//!
//! This crate manages a contiguous NVM range handed in by the caller,
//! serving fixed-size blocks out of 2MB slab extents through a two-level
//! heap hierarchy. All allocator metadata is volatile (DRAM): after a
//! crash, the caller replays its own persisted allocation log through the
//! restore path to rebuild it.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                        NvmAllocator                           |
//! |                                                               |
//! |  per-CPU heaps (no shared locks on the allocation fast path)  |
//! |  +--------------+  +--------------+       +--------------+    |
//! |  |    CPU 0     |  |    CPU 1     |  ...  |   CPU N-1    |    |
//! |  | chain/class  |  | chain/class  |       | chain/class  |    |
//! |  +------+-------+  +------+-------+       +------+-------+    |
//! |         |                 |                      |            |
//! |         v                 v                      v            |
//! |  +---------------------------------------------------------+  |
//! |  | Slab: bitmap + ring cache, per-slab spinlock            |  |
//! |  +---------------------------------------------------------+  |
//! |         ^                                  ^                 |
//! |         | offset -> slab                   | extents         |
//! |  +--------------+                 +------------------+       |
//! |  |  SlabIndex   |                 |  SpaceManager    |       |
//! |  | (rwlock map) |                 | (central mutex)  |       |
//! |  +--------------+                 +------------------+       |
//! +---------------------------------------------------------------+
//! ```
//!
//! # Design points
//!
//! - **Size classes**: ten power-of-two block sizes from 8 to 4096 bytes;
//!   larger requests are rejected.
//! - **Fast path**: a thread allocates from its own CPU's slab chains
//!   without shared locks; only the owning slab's spinlock is taken.
//! - **Remote free**: any thread may free any address; the owning slab is
//!   found through the index and its spinlock serializes the update.
//! - **Deferred reclaim**: emptied slabs stay on their chain for reuse;
//!   extents return to the space manager only at teardown.
//! - **Recovery**: `restore` re-reserves extents at exact offsets and
//!   replays block marks idempotently.
//!
//! # Example
//!
//! ```ignore
//! use nvm_slab::MappedRegion;
//!
//! // Simulate an NVM region with anonymous memory.
//! let region = MappedRegion::anonymous(64 * 1024 * 1024)?;
//!
//! nvm_slab::init(region.as_ptr(), region.len())?;
//!
//! let addr = nvm_slab::allocate(100)?; // served from the 128-byte class
//! nvm_slab::free(addr.as_ptr());
//!
//! nvm_slab::shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
mod config;
mod error;
mod heap;
mod index;
mod region;
mod slab;
mod space;
mod stats;
mod sync;

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

pub use allocator::{AllocatorStats, NvmAllocator};
pub use config::{
    BLOCK_CLASSES, CACHE_BATCH, CACHE_SIZE, DEFAULT_INDEX_CAPACITY, MAX_BLOCK_SIZE, MAX_CPUS,
    NUM_CLASSES, NvmConfig, SLAB_SIZE, block_size, blocks_per_slab, select_class,
};
pub use error::{AllocError, AllocResult};
pub use index::SlabIndex;
pub use region::MappedRegion;
pub use slab::{Slab, SlabStats};
pub use space::{FreeSegment, SpaceManager};
pub use stats::{AllocCounters, CounterSnapshot};

/// The process-global allocator instance.
static GLOBAL: RwLock<Option<Arc<NvmAllocator>>> = RwLock::new(None);

/// Install the process-global allocator over `[base, base + size)`.
///
/// Fails with [`AllocError::AlreadyInitialized`] if an allocator is
/// already installed; call [`shutdown`] first to replace it.
pub fn init(base: *mut u8, size: usize) -> AllocResult<()> {
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(AllocError::AlreadyInitialized);
    }
    *slot = Some(Arc::new(NvmAllocator::new(base, size)?));
    debug!(size, "global allocator installed");
    Ok(())
}

/// Tear down the process-global allocator. Idempotent.
///
/// Metadata is released once every outstanding [`instance`] handle is
/// dropped; the NVM region's bytes are not touched.
pub fn shutdown() {
    let previous = GLOBAL.write().take();
    if previous.is_some() {
        debug!("global allocator shut down");
    }
}

/// Get a handle to the process-global allocator.
pub fn instance() -> AllocResult<Arc<NvmAllocator>> {
    GLOBAL.read().clone().ok_or(AllocError::Uninitialized)
}

/// Allocate a block of at least `size` bytes from the global allocator.
pub fn allocate(size: usize) -> AllocResult<NonNull<u8>> {
    instance()?.allocate(size)
}

/// Return a block to the global allocator.
///
/// A no-op when the allocator is not initialized or the pointer is null.
pub fn free(ptr: *mut u8) {
    if let Ok(allocator) = instance() {
        allocator.free(ptr);
    }
}

/// Replay one persisted allocation record into the global allocator.
pub fn restore(ptr: *mut u8, size: usize) -> AllocResult<()> {
    instance()?.restore(ptr, size)
}
