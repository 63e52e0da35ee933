//! Coarse-grained free-space management for the NVM region.
//!
//! The space manager hands out slab-sized extents from a single contiguous
//! offset range. Free space is tracked as an address-ordered map of
//! segments, coalesced on release so that no two free segments ever abut.
//! The recovery path can also carve an extent at a specific offset.
//!
//! The manager itself is not synchronized; the allocator serializes all
//! mutations behind its central mutex.

use std::collections::BTreeMap;

use crate::config::SLAB_SIZE;
use crate::error::{AllocError, AllocResult};

const SLAB: u64 = SLAB_SIZE as u64;

/// A contiguous run of free, slab-aligned space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSegment {
    /// Starting NVM offset, slab-aligned.
    pub offset: u64,
    /// Length in bytes, a positive multiple of the slab size.
    pub size: u64,
}

/// Manager for slab-sized extents over a contiguous offset range.
///
/// Segments are keyed by offset so iteration is in address order; first-fit
/// allocation and neighbor lookups for coalescing both fall out of the
/// ordering. Segment count is bounded by the number of slabs, so the O(F)
/// scans stay cheap for this coarse workload.
pub struct SpaceManager {
    /// Free segments: offset -> size. No two entries overlap or abut.
    segments: BTreeMap<u64, u64>,
    /// Total bytes under management (after truncation to a slab multiple).
    managed: u64,
}

impl SpaceManager {
    /// Create a manager covering `[start_offset, start_offset + total_size)`.
    ///
    /// Sizes that are not a multiple of the slab size are truncated down;
    /// the remainder is never handed out. Fails if less than one slab of
    /// space remains.
    pub fn new(total_size: u64, start_offset: u64) -> AllocResult<Self> {
        let managed = total_size - (total_size % SLAB);
        if managed < SLAB {
            return Err(AllocError::InvalidArgument);
        }

        let mut segments = BTreeMap::new();
        segments.insert(start_offset, managed);

        Ok(Self { segments, managed })
    }

    /// Allocate one slab-sized extent, first-fit in address order.
    ///
    /// An exactly-sized segment is removed; a larger one shrinks from its
    /// front.
    pub fn alloc_slab(&mut self) -> AllocResult<u64> {
        let found = self
            .segments
            .iter()
            .find(|&(_, &size)| size >= SLAB)
            .map(|(&offset, &size)| (offset, size));

        let (offset, size) = found.ok_or(AllocError::Exhausted)?;

        self.segments.remove(&offset);
        if size > SLAB {
            self.segments.insert(offset + SLAB, size - SLAB);
        }

        Ok(offset)
    }

    /// Return the extent `[offset, offset + SLAB_SIZE)` to the free pool,
    /// merging with abutting neighbors.
    ///
    /// The offset must be slab-aligned and the extent must not overlap any
    /// free segment (it was previously handed out by this manager).
    pub fn free_slab(&mut self, offset: u64) {
        debug_assert_eq!(offset % SLAB, 0, "free of unaligned extent");

        let pred = self
            .segments
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let succ = self
            .segments
            .range(offset..)
            .next()
            .map(|(&o, &s)| (o, s));

        // Double free or overlap would corrupt the accounting.
        debug_assert!(pred.is_none_or(|(o, s)| o + s <= offset));
        debug_assert!(succ.is_none_or(|(o, _)| offset + SLAB <= o));

        let merge_pred = pred.filter(|&(o, s)| o + s == offset);
        let merge_succ = succ.filter(|&(o, _)| offset + SLAB == o);

        match (merge_pred, merge_succ) {
            (Some((pred_off, pred_size)), Some((succ_off, succ_size))) => {
                self.segments.remove(&succ_off);
                self.segments
                    .insert(pred_off, pred_size + SLAB + succ_size);
            }
            (Some((pred_off, pred_size)), None) => {
                self.segments.insert(pred_off, pred_size + SLAB);
            }
            (None, Some((succ_off, succ_size))) => {
                self.segments.remove(&succ_off);
                self.segments.insert(offset, SLAB + succ_size);
            }
            (None, None) => {
                self.segments.insert(offset, SLAB);
            }
        }
    }

    /// Carve the extent `[offset, offset + SLAB_SIZE)` out of free space.
    ///
    /// Recovery-only. Fails without mutation if no free segment fully
    /// covers the extent. Four cases: exact match removes the segment,
    /// head/tail matches shrink it, an interior match splits it in two.
    pub fn alloc_at(&mut self, offset: u64) -> AllocResult<()> {
        let end = offset + SLAB;

        let covering = self
            .segments
            .range(..=offset)
            .next_back()
            .map(|(&o, &s)| (o, s))
            .filter(|&(seg_off, seg_size)| seg_off + seg_size >= end);

        let (seg_off, seg_size) = covering.ok_or(AllocError::Unavailable)?;

        let head_match = seg_off == offset;
        let tail_match = seg_off + seg_size == end;

        match (head_match, tail_match) {
            (true, true) => {
                self.segments.remove(&seg_off);
            }
            (true, false) => {
                self.segments.remove(&seg_off);
                self.segments.insert(end, seg_size - SLAB);
            }
            (false, true) => {
                self.segments.insert(seg_off, seg_size - SLAB);
            }
            (false, false) => {
                self.segments.insert(seg_off, offset - seg_off);
                self.segments.insert(end, seg_off + seg_size - end);
            }
        }

        Ok(())
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.segments.values().sum()
    }

    /// Number of free segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total bytes under management.
    pub fn managed_bytes(&self) -> u64 {
        self.managed
    }

    /// Snapshot of the free segments in address order.
    pub fn segments(&self) -> Vec<FreeSegment> {
        self.segments
            .iter()
            .map(|(&offset, &size)| FreeSegment { offset, size })
            .collect()
    }
}
