//! Offset-to-slab lookup table.
//!
//! `free` only receives an address; the index maps its slab-aligned base
//! offset back to the owning slab. Keys are always multiples of the slab
//! size, so hashing divides that factor out before taking the bucket.
//!
//! The table has a fixed bucket count (a prime, 101 by default) and never
//! rehashes: the number of live slabs is bounded by `total_size /
//! SLAB_SIZE`, so chains stay short without growth. A single
//! reader-writer lock guards the whole table; lookups take the shared
//! side, insert and remove the exclusive side.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SLAB_SIZE;
use crate::error::{AllocError, AllocResult};
use crate::slab::Slab;

struct Entry {
    offset: u64,
    slab: Arc<Slab>,
}

struct Table {
    buckets: Box<[Vec<Entry>]>,
    len: usize,
}

/// Concurrent map from slab base offset to slab.
///
/// Holds a non-owning-in-spirit reference to each slab (an `Arc` clone);
/// removing an entry never destroys slab metadata still referenced
/// elsewhere.
pub struct SlabIndex {
    table: RwLock<Table>,
    capacity: usize,
}

impl SlabIndex {
    /// Create an index with a fixed bucket count.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "index capacity must be non-zero");
        let buckets = (0..capacity).map(|_| Vec::new()).collect();
        Self {
            table: RwLock::new(Table { buckets, len: 0 }),
            capacity,
        }
    }

    #[inline]
    fn bucket_of(&self, offset: u64) -> usize {
        ((offset / SLAB_SIZE as u64) % self.capacity as u64) as usize
    }

    /// Insert a mapping. Fails if the offset is already present.
    pub fn insert(&self, offset: u64, slab: Arc<Slab>) -> AllocResult<()> {
        let bucket_idx = self.bucket_of(offset);
        let mut table = self.table.write();

        let bucket = &mut table.buckets[bucket_idx];
        if bucket.iter().any(|entry| entry.offset == offset) {
            return Err(AllocError::Duplicate);
        }
        bucket.push(Entry { offset, slab });
        table.len += 1;

        Ok(())
    }

    /// Look up the slab covering a base offset.
    pub fn lookup(&self, offset: u64) -> Option<Arc<Slab>> {
        let bucket_idx = self.bucket_of(offset);
        let table = self.table.read();

        table.buckets[bucket_idx]
            .iter()
            .find(|entry| entry.offset == offset)
            .map(|entry| Arc::clone(&entry.slab))
    }

    /// Remove a mapping, returning the slab if it was present.
    pub fn remove(&self, offset: u64) -> Option<Arc<Slab>> {
        let bucket_idx = self.bucket_of(offset);
        let mut table = self.table.write();

        let bucket = &mut table.buckets[bucket_idx];
        let position = bucket.iter().position(|entry| entry.offset == offset)?;
        let entry = bucket.swap_remove(position);
        table.len -= 1;

        Some(entry.slab)
    }

    /// Number of indexed slabs.
    pub fn len(&self) -> usize {
        self.table.read().len
    }

    /// Whether the index holds no slabs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every indexed slab, for stats and invariant sweeps.
    pub fn slabs(&self) -> Vec<Arc<Slab>> {
        let table = self.table.read();
        table
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|entry| Arc::clone(&entry.slab)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAB: u64 = SLAB_SIZE as u64;

    fn slab_at(offset: u64) -> Arc<Slab> {
        Arc::new(Slab::new(3, offset).unwrap())
    }

    #[test]
    fn test_insert_lookup() {
        let index = SlabIndex::new(101);

        index.insert(0, slab_at(0)).unwrap();
        index.insert(5 * SLAB, slab_at(5 * SLAB)).unwrap();

        assert_eq!(index.lookup(0).unwrap().base_offset(), 0);
        assert_eq!(index.lookup(5 * SLAB).unwrap().base_offset(), 5 * SLAB);
        assert!(index.lookup(SLAB).is_none());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_insert_duplicate() {
        let index = SlabIndex::new(101);
        index.insert(SLAB, slab_at(SLAB)).unwrap();

        assert_eq!(
            index.insert(SLAB, slab_at(SLAB)).err(),
            Some(AllocError::Duplicate)
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove() {
        let index = SlabIndex::new(101);
        index.insert(2 * SLAB, slab_at(2 * SLAB)).unwrap();

        let removed = index.remove(2 * SLAB).unwrap();
        assert_eq!(removed.base_offset(), 2 * SLAB);
        assert!(index.lookup(2 * SLAB).is_none());
        assert!(index.remove(2 * SLAB).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_collision_chains() {
        // Capacity 3: offsets 0, 3, 6 (in slab units) all land in bucket 0.
        let index = SlabIndex::new(3);
        for slab_units in [0u64, 3, 6, 1, 4] {
            let offset = slab_units * SLAB;
            index.insert(offset, slab_at(offset)).unwrap();
        }

        for slab_units in [0u64, 3, 6, 1, 4] {
            let offset = slab_units * SLAB;
            assert_eq!(index.lookup(offset).unwrap().base_offset(), offset);
        }

        // Removing from the middle of a chain leaves the rest reachable.
        index.remove(3 * SLAB).unwrap();
        assert!(index.lookup(3 * SLAB).is_none());
        assert_eq!(index.lookup(6 * SLAB).unwrap().base_offset(), 6 * SLAB);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_slabs_snapshot() {
        let index = SlabIndex::new(7);
        for slab_units in 0..5u64 {
            let offset = slab_units * SLAB;
            index.insert(offset, slab_at(offset)).unwrap();
        }

        let mut offsets: Vec<u64> = index.slabs().iter().map(|s| s.base_offset()).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, SLAB, 2 * SLAB, 3 * SLAB, 4 * SLAB]);
    }

    #[test]
    fn test_shared_slab_survives_remove() {
        let index = SlabIndex::new(101);
        let slab = slab_at(0);
        index.insert(0, Arc::clone(&slab)).unwrap();

        let removed = index.remove(0).unwrap();
        // Both references still point at the same live metadata.
        assert!(Arc::ptr_eq(&slab, &removed));
    }

    #[test]
    fn test_concurrent_lookup() {
        let index = Arc::new(SlabIndex::new(101));
        for slab_units in 0..16u64 {
            let offset = slab_units * SLAB;
            index.insert(offset, slab_at(offset)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for round in 0..1_000u64 {
                    let offset = (round % 16) * SLAB;
                    assert_eq!(index.lookup(offset).unwrap().base_offset(), offset);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
