//! Operation counters for the allocator.
//!
//! Lock-free counters shared across threads, with point-in-time snapshots
//! for reporting and interval diffs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking allocator operations.
#[derive(Debug, Default)]
pub struct AllocCounters {
    /// Successful block allocations.
    pub allocations: AtomicU64,
    /// Failed allocation attempts (bad size or exhausted space).
    pub allocation_failures: AtomicU64,
    /// Block frees for managed addresses.
    pub frees: AtomicU64,
    /// Frees of addresses no slab manages.
    pub unmanaged_frees: AtomicU64,
    /// Slabs carved out of the space manager.
    pub slabs_created: AtomicU64,
    /// Blocks restored by recovery.
    pub restores: AtomicU64,
    /// Recovery records rejected.
    pub restore_failures: AtomicU64,
}

impl AllocCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation attempt.
    #[inline]
    pub fn record_allocation(&self, success: bool) {
        if success {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a free.
    #[inline]
    pub fn record_free(&self, managed: bool) {
        if managed {
            self.frees.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unmanaged_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a slab acquisition from the space manager.
    #[inline]
    pub fn record_slab_created(&self) {
        self.slabs_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovery record outcome.
    #[inline]
    pub fn record_restore(&self, success: bool) {
        if success {
            self.restores.fetch_add(1, Ordering::Relaxed);
        } else {
            self.restore_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            unmanaged_frees: self.unmanaged_frees.load(Ordering::Relaxed),
            slabs_created: self.slabs_created.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            restore_failures: self.restore_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Successful block allocations.
    pub allocations: u64,
    /// Failed allocation attempts.
    pub allocation_failures: u64,
    /// Frees of managed addresses.
    pub frees: u64,
    /// Frees of unmanaged addresses.
    pub unmanaged_frees: u64,
    /// Slabs carved from the space manager.
    pub slabs_created: u64,
    /// Blocks restored by recovery.
    pub restores: u64,
    /// Recovery records rejected.
    pub restore_failures: u64,
}

impl CounterSnapshot {
    /// Live blocks implied by the counters (allocations + restores minus
    /// frees).
    pub fn live_blocks(&self) -> u64 {
        (self.allocations + self.restores).saturating_sub(self.frees)
    }

    /// Compute the difference between two snapshots (`self - other`).
    pub fn diff(&self, other: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            allocations: self.allocations.saturating_sub(other.allocations),
            allocation_failures: self
                .allocation_failures
                .saturating_sub(other.allocation_failures),
            frees: self.frees.saturating_sub(other.frees),
            unmanaged_frees: self.unmanaged_frees.saturating_sub(other.unmanaged_frees),
            slabs_created: self.slabs_created.saturating_sub(other.slabs_created),
            restores: self.restores.saturating_sub(other.restores),
            restore_failures: self.restore_failures.saturating_sub(other.restore_failures),
        }
    }
}
