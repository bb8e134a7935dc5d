//! `PageDirectory`: the sorted map from [`PageKey`] to [`CachePointer`],
//! the exclusive-pages set, and the dirty-pages tracking table (spec.md
//! §3, §4.4).
//!
//! The main map is kept as a single `RwLock<BTreeMap<..>>` rather than a
//! hash-sharded map, because spec.md needs ordered per-file sub-range
//! iteration and tail-iteration from an arbitrary key for adjacency
//! coalescing — properties a hash-sharded map can't give. The dirty-pages
//! table, by contrast, only needs point insert/remove plus an occasional
//! full drain, so it follows spec.md §9's "global-ish state"
//! double-buffering idiom directly: a `DashMap` mutated under the *read*
//! side of a coordinating lock (the common path, many concurrent
//! dirtiers), drained to flusher-local state under the *write* side (rare,
//! one drainer).
//!
//! `local_dirty_pages`/`local_dirty_pages_by_lsn` are spec'd as directory
//! state but described as "flusher-private" and lock-free — they live on
//! [`crate::flusher::Flusher`] instead, since it is the directory's only
//! consumer of that reflection and the sole thread that ever touches it;
//! keeping them there avoids giving `PageDirectory` fields no other code
//! may safely read.

use crate::page_key::{FileId, PageKey};
use crate::pointer::CachePointer;
use crate::wal::Lsn;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct PageDirectory {
    write_cache_pages: RwLock<BTreeMap<PageKey, Arc<CachePointer>>>,
    exclusive_write_pages: RwLock<BTreeSet<PageKey>>,

    dirty_pages: DashMap<PageKey, Lsn>,
    /// Coordinates the common (read) path of inserting into `dirty_pages`
    /// against the rare (write) path of draining it wholesale.
    dirty_pages_lock: RwLock<()>,

    /// Pages allocated during `load`'s allocation path that haven't been
    /// flushed once yet (spec.md §4.4.1, §4.5.2).
    not_flushed_count: AtomicUsize,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            write_cache_pages: RwLock::new(BTreeMap::new()),
            exclusive_write_pages: RwLock::new(BTreeSet::new()),
            dirty_pages: DashMap::new(),
            dirty_pages_lock: RwLock::new(()),
            not_flushed_count: AtomicUsize::new(0),
        }
    }

    pub fn incr_not_flushed(&self) {
        self.not_flushed_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_not_flushed(&self) {
        self.not_flushed_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn not_flushed_count(&self) -> usize {
        self.not_flushed_count.load(Ordering::Acquire)
    }

    // -- write_cache_pages ------------------------------------------------

    pub fn get(&self, key: PageKey) -> Option<Arc<CachePointer>> {
        self.write_cache_pages.read().get(&key).cloned()
    }

    /// Insert `ptr` under `key` if absent. Returns the pointer actually in
    /// the directory afterwards (the new one on success, the existing one
    /// on a race) along with whether the insert happened.
    pub fn insert_if_absent(&self, key: PageKey, ptr: Arc<CachePointer>) -> (Arc<CachePointer>, bool) {
        let mut map = self.write_cache_pages.write();
        if let Some(existing) = map.get(&key) {
            return (existing.clone(), false);
        }
        map.insert(key, ptr.clone());
        (ptr, true)
    }

    pub fn remove(&self, key: PageKey) -> Option<Arc<CachePointer>> {
        self.write_cache_pages.write().remove(&key)
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.write_cache_pages.read().contains_key(&key)
    }

    pub fn write_cache_size(&self) -> usize {
        self.write_cache_pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.write_cache_pages.read().is_empty()
    }

    /// Ordered snapshot of every page belonging to `file_id`.
    pub fn file_range(&self, file_id: FileId) -> Vec<(PageKey, Arc<CachePointer>)> {
        let map = self.write_cache_pages.read();
        map.range(PageKey::floor(file_id)..=PageKey::ceiling(file_id))
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Ordered snapshot of every page at or after `key` (tail iteration,
    /// used to resume scanning near the oldest-LSN page).
    pub fn tail_from(&self, key: PageKey) -> Vec<(PageKey, Arc<CachePointer>)> {
        let map = self.write_cache_pages.read();
        map.range(key..).map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Ordered snapshot of the whole directory.
    pub fn snapshot(&self) -> Vec<(PageKey, Arc<CachePointer>)> {
        self.write_cache_pages
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    // -- exclusive_write_pages ---------------------------------------------

    pub fn add_exclusive(&self, key: PageKey) {
        self.exclusive_write_pages.write().insert(key);
    }

    pub fn remove_exclusive(&self, key: PageKey) {
        self.exclusive_write_pages.write().remove(&key);
    }

    pub fn exclusive_count(&self) -> usize {
        self.exclusive_write_pages.read().len()
    }

    /// Ordered snapshot of the exclusive set, for the flusher's
    /// ring-iteration over exclusive pages.
    pub fn exclusive_snapshot(&self) -> Vec<PageKey> {
        self.exclusive_write_pages.read().iter().copied().collect()
    }

    // -- dirty_pages ---------------------------------------------------

    /// Insert `(key, lsn)` if `key` is absent, under the coordinating
    /// lock's read side — the common, highly concurrent path.
    pub fn mark_dirty_if_absent(&self, key: PageKey, lsn: Lsn) {
        let _guard = self.dirty_pages_lock.read();
        self.dirty_pages.entry(key).or_insert(lsn);
    }

    pub fn dirty_lsn(&self, key: PageKey) -> Option<Lsn> {
        self.dirty_pages.get(&key).map(|e| *e)
    }

    pub fn remove_dirty(&self, key: PageKey) {
        let _guard = self.dirty_pages_lock.read();
        self.dirty_pages.remove(&key);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_pages.len()
    }

    /// Drain every `(key, lsn)` pair under the coordinating lock's write
    /// side — the rare path, exclusive to the flusher.
    pub fn drain_dirty(&self) -> Vec<(PageKey, Lsn)> {
        let _guard = self.dirty_pages_lock.write();
        let drained: Vec<(PageKey, Lsn)> = self
            .dirty_pages
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        self.dirty_pages.clear();
        drained
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, HeapBufferPool};

    fn ptr(file_id: FileId, index: i64) -> Arc<CachePointer> {
        let pool = HeapBufferPool::new(4096);
        CachePointer::new(file_id, index, pool.acquire(true))
    }

    #[test]
    fn insert_if_absent_is_idempotent() {
        let dir = PageDirectory::new();
        let key = PageKey::new(1, 0);
        let a = ptr(1, 0);
        let (got_a, inserted_a) = dir.insert_if_absent(key, a.clone());
        assert!(inserted_a);
        assert!(Arc::ptr_eq(&got_a, &a));

        let b = ptr(1, 0);
        let (got_b, inserted_b) = dir.insert_if_absent(key, b);
        assert!(!inserted_b);
        assert!(Arc::ptr_eq(&got_b, &a));
    }

    #[test]
    fn file_range_is_ordered_and_scoped() {
        let dir = PageDirectory::new();
        for i in [2, 0, 1] {
            dir.insert_if_absent(PageKey::new(1, i), ptr(1, i));
        }
        dir.insert_if_absent(PageKey::new(2, 0), ptr(2, 0));

        let range = dir.file_range(1);
        let indices: Vec<i64> = range.iter().map(|(k, _)| k.page_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn tail_from_skips_earlier_keys() {
        let dir = PageDirectory::new();
        for i in 0..5 {
            dir.insert_if_absent(PageKey::new(1, i), ptr(1, i));
        }
        let tail = dir.tail_from(PageKey::new(1, 2));
        let indices: Vec<i64> = tail.iter().map(|(k, _)| k.page_index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[test]
    fn dirty_pages_first_writer_wins() {
        let dir = PageDirectory::new();
        let key = PageKey::new(1, 0);
        dir.mark_dirty_if_absent(key, Lsn::new(0, 5));
        dir.mark_dirty_if_absent(key, Lsn::new(0, 9));
        assert_eq!(dir.dirty_lsn(key), Some(Lsn::new(0, 5)));
    }

    #[test]
    fn drain_dirty_empties_the_table() {
        let dir = PageDirectory::new();
        dir.mark_dirty_if_absent(PageKey::new(1, 0), Lsn::new(0, 1));
        dir.mark_dirty_if_absent(PageKey::new(1, 1), Lsn::new(0, 2));
        let drained = dir.drain_dirty();
        assert_eq!(drained.len(), 2);
        assert_eq!(dir.dirty_count(), 0);
    }
}
