//! Per-extent block management: bitmap plus ring-buffer free cache.
//!
//! A [`Slab`] manages the fixed-size blocks of one 2MB extent for one size
//! class. The bitmap is the source of truth: a set bit means the block is
//! reserved, either held by a caller or pre-reserved into the ring cache.
//! A clear bit means the block is truly free and not cached. The ring
//! turns most alloc/free calls into pointer arithmetic; the bitmap is only
//! scanned when the ring runs dry, and only written back when it overflows.
//!
//! All metadata is DRAM-resident and volatile; the extent's NVM bytes are
//! never touched. Recovery rebuilds the bitmap one block at a time via
//! [`Slab::restore_mark`].

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use tracing::warn;

use crate::config::{self, CACHE_BATCH, CACHE_SIZE};
use crate::error::{AllocError, AllocResult};
use crate::sync::SpinLock;

/// Metadata for one slab extent.
///
/// Thread-safe: the bitmap, ring cache, and counter are only mutated under
/// the internal spinlock, which is held for the duration of a single O(1)
/// amortized call and never across external calls.
pub struct Slab {
    /// Slab-aligned NVM offset this extent covers.
    base_offset: u64,
    /// Size class of every block in this slab.
    class_id: u8,
    /// Block size in bytes.
    block_size: u32,
    /// Number of blocks the extent holds.
    total_blocks: u32,
    /// Blocks currently held by callers. Written only under the lock;
    /// read relaxed by the full/empty hints.
    allocated: AtomicU32,
    /// Bitmap and ring cache, guarded by the spinlock.
    inner: SpinLock<SlabInner>,
    /// Next slab in the owning per-CPU chain. Managed by the chain, never
    /// by the slab itself.
    pub(crate) next_in_chain: AtomicPtr<Slab>,
}

struct SlabInner {
    /// One bit per block. Set = reserved (held by a caller or cached).
    bitmap: Box<[u64]>,
    /// FIFO of pre-reserved free block indices.
    cache: BlockCache,
}

/// Fixed-capacity ring buffer of free block indices.
struct BlockCache {
    head: usize,
    tail: usize,
    count: usize,
    slots: [u32; CACHE_SIZE],
}

impl BlockCache {
    fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            count: 0,
            slots: [0; CACHE_SIZE],
        }
    }

    fn push(&mut self, block_idx: u32) {
        debug_assert!(self.count < CACHE_SIZE);
        self.slots[self.tail] = block_idx;
        self.tail = (self.tail + 1) % CACHE_SIZE;
        self.count += 1;
    }

    fn pop(&mut self) -> u32 {
        debug_assert!(self.count > 0);
        let block_idx = self.slots[self.head];
        self.head = (self.head + 1) % CACHE_SIZE;
        self.count -= 1;
        block_idx
    }
}

impl SlabInner {
    #[inline]
    fn bit_is_set(&self, block_idx: u32) -> bool {
        let i = block_idx as usize;
        (self.bitmap[i / 64] >> (i % 64)) & 1 == 1
    }

    #[inline]
    fn set_bit(&mut self, block_idx: u32) {
        let i = block_idx as usize;
        self.bitmap[i / 64] |= 1 << (i % 64);
    }

    #[inline]
    fn clear_bit(&mut self, block_idx: u32) {
        let i = block_idx as usize;
        self.bitmap[i / 64] &= !(1 << (i % 64));
    }

    fn popcount(&self) -> u32 {
        self.bitmap.iter().map(|word| word.count_ones()).sum()
    }

    /// Scan the bitmap lowest-bit-first and pre-reserve up to
    /// [`CACHE_BATCH`] clear bits into the ring.
    fn refill(&mut self, total_blocks: u32) -> u32 {
        let mut filled = 0;

        'scan: for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            while *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                let block_idx = (word_idx as u32) * 64 + bit;
                if block_idx >= total_blocks {
                    break 'scan;
                }

                *word |= 1 << bit;
                self.cache.push(block_idx);
                filled += 1;
                if filled == CACHE_BATCH as u32 {
                    break 'scan;
                }
            }
        }

        filled
    }

    /// Write cached indices back to the bitmap, oldest first, until the
    /// ring is down to [`CACHE_BATCH`] entries.
    fn drain(&mut self) {
        while self.cache.count > CACHE_BATCH {
            let block_idx = self.cache.pop();
            self.clear_bit(block_idx);
        }
    }
}

impl Slab {
    /// Create the metadata for one slab extent.
    ///
    /// The bitmap starts zeroed: every block is free and uncached. Fails
    /// only for an unknown size class.
    pub fn new(class_id: u8, base_offset: u64) -> AllocResult<Self> {
        let block_size = config::block_size(class_id).ok_or(AllocError::InvalidArgument)?;
        let total_blocks = (config::SLAB_SIZE / block_size) as u32;
        let words = total_blocks.div_ceil(64) as usize;

        Ok(Self {
            base_offset,
            class_id,
            block_size: block_size as u32,
            total_blocks,
            allocated: AtomicU32::new(0),
            inner: SpinLock::new(SlabInner {
                bitmap: vec![0u64; words].into_boxed_slice(),
                cache: BlockCache::new(),
            }),
            next_in_chain: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    /// Allocate one block, returning its index within the slab.
    ///
    /// Pops from the ring cache; when the ring is empty, refills it from
    /// the bitmap first. Fails with [`AllocError::SlabFull`] when every
    /// block is held.
    pub fn alloc(&self) -> AllocResult<u32> {
        let mut inner = self.inner.lock();

        if inner.cache.count == 0 && self.allocated.load(Ordering::Relaxed) < self.total_blocks {
            inner.refill(self.total_blocks);
        }
        if inner.cache.count == 0 {
            return Err(AllocError::SlabFull);
        }

        let block_idx = inner.cache.pop();
        let held = self.allocated.load(Ordering::Relaxed);
        self.allocated.store(held + 1, Ordering::Relaxed);

        Ok(block_idx)
    }

    /// Return one block to the slab.
    ///
    /// The index is pushed onto the ring with its bitmap bit left set
    /// (reserved-as-cached); a full ring is first drained down to the batch
    /// low-water mark.
    pub fn free(&self, block_idx: u32) -> AllocResult<()> {
        if block_idx >= self.total_blocks {
            return Err(AllocError::OutOfRange);
        }

        let mut inner = self.inner.lock();
        debug_assert!(inner.bit_is_set(block_idx), "free of an unreserved block");

        if inner.cache.count == CACHE_SIZE {
            inner.drain();
        }
        inner.cache.push(block_idx);

        let held = self.allocated.load(Ordering::Relaxed);
        if held == 0 {
            warn!(base_offset = self.base_offset, "free on an empty slab");
        } else {
            self.allocated.store(held - 1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Mark a block as held, for recovery. Idempotent.
    ///
    /// Sets the block's bit and counts it as held only if the bit was
    /// clear; a block already reserved is left untouched.
    pub fn restore_mark(&self, block_idx: u32) -> AllocResult<()> {
        if block_idx >= self.total_blocks {
            return Err(AllocError::OutOfRange);
        }

        let mut inner = self.inner.lock();
        if !inner.bit_is_set(block_idx) {
            inner.set_bit(block_idx);
            let held = self.allocated.load(Ordering::Relaxed);
            self.allocated.store(held + 1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Whether every block is held. Relaxed hint; may be momentarily stale
    /// under concurrent mutation.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) == self.total_blocks
    }

    /// Whether no block is held. Relaxed hint; the ring may still hold
    /// pre-reservations.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) == 0
    }

    /// Slab-aligned NVM offset this slab covers.
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Size class of this slab's blocks.
    #[inline]
    pub fn class_id(&self) -> u8 {
        self.class_id
    }

    /// Block size in bytes.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks in this slab.
    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Snapshot of the slab's occupancy.
    pub fn stats(&self) -> SlabStats {
        let inner = self.inner.lock();
        SlabStats {
            base_offset: self.base_offset,
            class_id: self.class_id,
            block_size: self.block_size,
            total_blocks: self.total_blocks,
            allocated: self.allocated.load(Ordering::Relaxed),
            cached: inner.cache.count as u32,
            reserved: inner.popcount(),
        }
    }
}

/// Point-in-time occupancy of one slab.
#[derive(Debug, Clone, Copy)]
pub struct SlabStats {
    /// Slab-aligned NVM offset.
    pub base_offset: u64,
    /// Size class ID.
    pub class_id: u8,
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of blocks in the slab.
    pub total_blocks: u32,
    /// Blocks held by callers.
    pub allocated: u32,
    /// Free blocks pre-reserved in the ring cache.
    pub cached: u32,
    /// Set bits in the bitmap. Always equals `allocated + cached`.
    pub reserved: u32,
}
