//! Sharded per-key locking with an ordered batch-acquire primitive.
//!
//! A fixed `Vec<RwLock<()>>` sharded by hashed key: the locks guard the
//! *content* of pages (buffer bytes, pin/version state), not a lookup
//! structure, so there's no map behind each shard. All multi-key
//! acquisitions go through [`PartitionedPageLocks::acquire_shared_batch`] /
//! `acquire_exclusive_batch`, which sort keys by [`PageKey`]'s natural
//! order, map to partition indices, sort and deduplicate those indices, and
//! only then lock each distinct partition once — this fixed order is the
//! system's only deadlock-avoidance mechanism (spec.md §4.1, §5).

use crate::page_key::PageKey;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::hash::{Hash, Hasher};

/// Fixed array of rw-locks indexed by `hash(key) mod partitions`.
pub struct PartitionedPageLocks {
    partitions: Vec<RwLock<()>>,
}

impl PartitionedPageLocks {
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "partition count must be non-zero");
        Self {
            partitions: (0..partitions).map(|_| RwLock::new(())).collect(),
        }
    }

    fn index(&self, key: PageKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions.len()
    }

    pub fn acquire_shared(&self, key: PageKey) -> RwLockReadGuard<'_, ()> {
        self.partitions[self.index(key)].read()
    }

    pub fn acquire_exclusive(&self, key: PageKey) -> RwLockWriteGuard<'_, ()> {
        self.partitions[self.index(key)].write()
    }

    pub fn try_acquire_exclusive(&self, key: PageKey) -> Option<RwLockWriteGuard<'_, ()>> {
        self.partitions[self.index(key)].try_write()
    }

    /// Sort `keys` by [`PageKey`]'s natural order, dedup the partitions they
    /// land in, and take shared locks on each distinct partition in that
    /// order. Returns guards in acquisition order; dropping them all at
    /// once (or letting the `Vec` fall out of scope) releases every
    /// partition.
    pub fn acquire_shared_batch(&self, keys: &[PageKey]) -> Vec<RwLockReadGuard<'_, ()>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        let mut partitions: Vec<usize> = sorted.iter().map(|k| self.index(*k)).collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions.into_iter().map(|i| self.partitions[i].read()).collect()
    }

    /// Exclusive counterpart of [`acquire_shared_batch`].
    pub fn acquire_exclusive_batch(&self, keys: &[PageKey]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        let mut partitions: Vec<usize> = sorted.iter().map(|k| self.index(*k)).collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions.into_iter().map(|i| self.partitions[i].write()).collect()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_partition() {
        let locks = PartitionedPageLocks::new(16);
        let key = PageKey::new(1, 42);
        assert_eq!(locks.index(key), locks.index(key));
    }

    #[test]
    fn batch_acquire_dedupes_partitions() {
        let locks = PartitionedPageLocks::new(4);
        let keys: Vec<PageKey> = (0..4).map(|i| PageKey::new(1, i)).collect();
        let guards = locks.acquire_shared_batch(&keys);
        assert!(guards.len() <= 4);
        assert!(!guards.is_empty());
    }

    #[test]
    fn exclusive_batch_blocks_overlap() {
        let locks = PartitionedPageLocks::new(1);
        let key = PageKey::new(1, 0);
        let _guard = locks.acquire_exclusive(key);
        assert!(locks.try_acquire_exclusive(key).is_none());
    }
}
