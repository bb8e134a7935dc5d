//! `CachePointer`: a reference-counted, pinned page buffer with a
//! per-page rw-lock and a version counter (spec.md §3, §4.3).
//!
//! Readers and writers are tracked as separate counts rather than a single
//! pin count, and writer-count transitions are reported through a listener
//! capability instead of a direct field write, per spec.md §9's
//! "Polymorphism via callbacks" note.

use crate::buffer_pool::Buffer;
use crate::page_key::{FileId, PageIndex, PageKey};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The capability a [`CachePointer`] uses to tell the owning cache that its
/// writer count crossed 0↔1, so the cache can maintain its exclusive-pages
/// bookkeeping without the pointer knowing anything about the cache's
/// internals.
pub trait WritersListener: Send + Sync {
    /// First writer arrived: the page has no readers and one or more
    /// writers, making it eligible for eager flushing on overflow.
    fn add_only_writers(&self, file_id: FileId, page_index: PageIndex);

    /// Last writer departed.
    fn remove_only_writers(&self, file_id: FileId, page_index: PageIndex);
}

/// A pinned, reference-counted page buffer.
pub struct CachePointer {
    pub file_id: FileId,
    pub page_index: PageIndex,

    buffer: RwLock<Buffer>,
    readers_count: AtomicU32,
    writers_count: AtomicU32,
    version: AtomicU64,
    in_write_cache: AtomicBool,
    not_flushed: AtomicBool,

    writers_listener: RwLock<Option<Arc<dyn WritersListener>>>,
}

impl CachePointer {
    pub fn new(file_id: FileId, page_index: PageIndex, buffer: Buffer) -> Arc<Self> {
        Arc::new(Self {
            file_id,
            page_index,
            buffer: RwLock::new(buffer),
            readers_count: AtomicU32::new(0),
            writers_count: AtomicU32::new(0),
            version: AtomicU64::new(0),
            in_write_cache: AtomicBool::new(false),
            not_flushed: AtomicBool::new(false),
            writers_listener: RwLock::new(None),
        })
    }

    pub fn key(&self) -> PageKey {
        PageKey::new(self.file_id, self.page_index)
    }

    // -- buffer access ------------------------------------------------

    pub fn acquire_shared_buffer(&self) -> RwLockReadGuard<'_, Buffer> {
        self.buffer.read()
    }

    /// Acquire exclusive access. Bumps the version counter on release via
    /// [`Self::release_exclusive`] — callers must call that (not just drop
    /// the guard) to record the mutation.
    pub fn acquire_exclusive_buffer(&self) -> RwLockWriteGuard<'_, Buffer> {
        self.buffer.write()
    }

    pub fn try_acquire_shared(&self) -> Option<RwLockReadGuard<'_, Buffer>> {
        self.buffer.try_read()
    }

    /// Record that an exclusive section modified the page contents.
    pub fn release_exclusive(&self, _guard: RwLockWriteGuard<'_, Buffer>) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    // -- reader/writer counts ------------------------------------------

    pub fn readers_count(&self) -> u32 {
        self.readers_count.load(Ordering::Acquire)
    }

    pub fn writers_count(&self) -> u32 {
        self.writers_count.load(Ordering::Acquire)
    }

    pub fn increment_readers(&self) {
        self.readers_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if both counts reached zero, meaning the pointer's
    /// buffer is eligible to be returned to the pool.
    pub fn decrement_readers(&self) -> bool {
        let prev = self.readers_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "decrement_readers underflow");
        prev == 1 && self.writers_count() == 0
    }

    /// Increment writers. If this is the page's first writer (0 -> 1) and
    /// it currently has no readers, fires `add_only_writers` on the
    /// attached listener.
    pub fn increment_writers(&self) {
        let prev = self.writers_count.fetch_add(1, Ordering::AcqRel);
        if prev == 0 && self.readers_count() == 0 {
            if let Some(listener) = self.writers_listener.read().as_ref() {
                listener.add_only_writers(self.file_id, self.page_index);
            }
        }
    }

    /// Decrement writers. If this was the last writer (1 -> 0) and the page
    /// had no readers, fires `remove_only_writers`. Returns true if both
    /// counts are now zero (buffer reclaimable).
    pub fn decrement_writers(&self) -> bool {
        let prev = self.writers_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "decrement_writers underflow");
        if prev == 1 && self.readers_count() == 0 {
            if let Some(listener) = self.writers_listener.write().take() {
                listener.remove_only_writers(self.file_id, self.page_index);
            }
        }
        prev == 1 && self.readers_count() == 0
    }

    pub fn attach_writers_listener(&self, listener: Arc<dyn WritersListener>) {
        *self.writers_listener.write() = Some(listener);
    }

    /// True while the page has writers but no readers — the "exclusive"
    /// state eligible for eager flushing (spec.md glossary).
    pub fn is_exclusive(&self) -> bool {
        self.writers_count() > 0 && self.readers_count() == 0
    }

    // -- flags -----------------------------------------------------------

    pub fn in_write_cache(&self) -> bool {
        self.in_write_cache.load(Ordering::Acquire)
    }

    pub fn set_in_write_cache(&self, value: bool) {
        self.in_write_cache.store(value, Ordering::Release);
    }

    pub fn not_flushed(&self) -> bool {
        self.not_flushed.load(Ordering::Acquire)
    }

    pub fn set_not_flushed(&self, value: bool) {
        self.not_flushed.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, HeapBufferPool};
    use std::sync::atomic::AtomicU32;

    struct CountingListener {
        added: AtomicU32,
        removed: AtomicU32,
    }

    impl WritersListener for CountingListener {
        fn add_only_writers(&self, _file_id: FileId, _page_index: PageIndex) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        fn remove_only_writers(&self, _file_id: FileId, _page_index: PageIndex) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pointer() -> Arc<CachePointer> {
        let pool = HeapBufferPool::new(4096);
        CachePointer::new(1, 0, pool.acquire(true))
    }

    #[test]
    fn version_bumps_on_exclusive_release() {
        let ptr = pointer();
        assert_eq!(ptr.version(), 0);
        let guard = ptr.acquire_exclusive_buffer();
        ptr.release_exclusive(guard);
        assert_eq!(ptr.version(), 1);
    }

    #[test]
    fn writers_listener_fires_on_0_to_1_and_1_to_0() {
        let ptr = pointer();
        let listener = Arc::new(CountingListener {
            added: AtomicU32::new(0),
            removed: AtomicU32::new(0),
        });
        ptr.attach_writers_listener(listener.clone());

        ptr.increment_writers();
        assert_eq!(listener.added.load(Ordering::SeqCst), 1);

        ptr.increment_writers();
        assert_eq!(listener.added.load(Ordering::SeqCst), 1, "second writer shouldn't refire");

        ptr.decrement_writers();
        assert_eq!(listener.removed.load(Ordering::SeqCst), 0, "still one writer left");

        ptr.decrement_writers();
        assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exclusive_iff_writers_and_no_readers() {
        let ptr = pointer();
        assert!(!ptr.is_exclusive());
        ptr.increment_writers();
        assert!(ptr.is_exclusive());
        ptr.increment_readers();
        assert!(!ptr.is_exclusive());
    }

    #[test]
    fn reclaimable_when_both_counts_hit_zero() {
        let ptr = pointer();
        ptr.increment_readers();
        ptr.increment_writers();
        assert!(!ptr.decrement_writers());
        assert!(ptr.decrement_readers());
    }
}
