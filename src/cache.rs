//! `WOWCache`: the public facade tying [`crate::directory::PageDirectory`],
//! [`crate::flusher::Flusher`], [`crate::registry::FileRegistry`] and the
//! external collaborators together (spec.md §4.4).
//!
//! One struct owns every subsystem, exposes the orchestration-level API,
//! and implements the callback traits ([`WritersListener`]) its own
//! collaborators need to call back into it.

use crate::buffer_pool::BufferPool;
use crate::config::CacheConfig;
use crate::directory::PageDirectory;
use crate::error::{CacheError, Result};
use crate::events::EventHub;
use crate::file_io::{FileLayer, OpenFileContainer};
use crate::flusher::{Flusher, LatchSlot};
use crate::locks::PartitionedPageLocks;
use crate::page_key::{FileId, PageIndex, PageKey};
use crate::pointer::{CachePointer, WritersListener};
use crate::registry::FileRegistry;
use crate::verify::{check_stored_pages, PageIntegrityError, VerifyListener};
use crate::wal::{Lsn, Wal};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, instrument};

struct Inner {
    config: CacheConfig,
    directory: Arc<PageDirectory>,
    locks: Arc<PartitionedPageLocks>,
    files: Arc<OpenFileContainer>,
    pool: Arc<dyn BufferPool>,
    wal: Option<Arc<dyn Wal>>,
    registry: FileRegistry,
    events: Arc<EventHub>,
    latch_slot: Arc<LatchSlot>,

    amount_of_new_pages_added: AtomicU64,
    last_free_space_check: AtomicU64,
}

/// The write-back page cache. Cheaply cloneable (`Arc`-backed); the
/// flusher holds its own handle to the same shared state.
#[derive(Clone)]
pub struct WOWCache {
    inner: Arc<Inner>,
    flusher: Arc<Flusher>,
}

impl WOWCache {
    pub fn open(
        dir: impl AsRef<Path>,
        config: CacheConfig,
        file_layer: Arc<dyn FileLayer>,
        pool: Arc<dyn BufferPool>,
        wal: Option<Arc<dyn Wal>>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();
        let registry = FileRegistry::load_or_create(dir)?;
        let files = Arc::new(OpenFileContainer::new(file_layer, config.open_file_capacity));
        for (name, file_id) in registry.active_entries() {
            files.register_name(file_id, name);
        }

        let directory = Arc::new(PageDirectory::new());
        let locks = Arc::new(PartitionedPageLocks::new(config.lock_partitions));
        let latch_slot = Arc::new(LatchSlot::new());
        let events = Arc::new(EventHub::new());

        // The flusher is handed the same directory/locks/events as `Inner`
        // so the two sides of the facade observe one shared state — it is
        // not a second, independent cache.
        let flusher = Arc::new(Flusher::spawn(
            directory.clone(),
            locks.clone(),
            files.clone(),
            pool.clone(),
            wal.clone(),
            config.clone(),
            events.clone(),
            latch_slot.clone(),
        ));

        let inner = Arc::new(Inner {
            config,
            directory,
            locks,
            files,
            pool,
            wal,
            registry,
            events,
            latch_slot,
            amount_of_new_pages_added: AtomicU64::new(0),
            last_free_space_check: AtomicU64::new(0),
        });

        Ok(Self { inner, flusher })
    }

    fn external_file_id(&self, internal: FileId) -> u64 {
        crate::page_key::compose_external_id(self.inner.config.storage_id, internal)
    }

    /// Accepts either a bare internal file id or a composed external id
    /// (`(storage_id << 32) | internal_id`) — both recover the same low 32
    /// bits (spec.md §6).
    fn resolve_file_id(&self, id_or_external: u64) -> FileId {
        crate::page_key::extract_internal_id(id_or_external)
    }

    // -- registry-facing operations ---------------------------------------

    pub fn create_file(&self, name: &str) -> Result<u64> {
        let id = self.inner.registry.add(name)?;
        self.inner.files.register_name(id, name.to_string());
        Ok(self.external_file_id(id))
    }

    /// Look up the external file id of a live registry entry, if any
    /// (spec.md scenario "rename survives reopen": `load("b")` recovers the
    /// renamed file's id after a fresh cache instance is opened).
    pub fn lookup_file(&self, name: &str) -> Option<u64> {
        self.inner.registry.lookup(name).map(|id| self.external_file_id(id))
    }

    pub async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        self.inner.registry.rename(old, new)?;
        self.inner.files.layer().rename(old, new).await
    }

    /// §4.4: truncate a file's in-memory pages without touching its
    /// registry entry — callers re-allocate from `load`'s allocation path.
    pub async fn truncate_file(&self, file_id: u64) -> Result<()> {
        let internal = self.resolve_file_id(file_id);
        self.flusher.remove_file_pages(internal).await
    }

    pub async fn delete_file(&self, name: &str, file_id: u64) -> Result<()> {
        let internal = self.resolve_file_id(file_id);
        self.flusher.remove_file_pages(internal).await?;
        self.inner.files.forget(internal);
        self.inner.registry.delete(name)?;
        self.inner.files.layer().delete(name).await
    }

    pub async fn close(&self, file_id: u64, flush: bool) -> Result<()> {
        let internal = self.resolve_file_id(file_id);
        if flush {
            self.flusher.flush_file(internal).await?;
        }
        self.inner.files.forget(internal);
        Ok(())
    }

    pub async fn close_all(&self) -> Result<()> {
        self.flush_all().await?;
        self.flusher.shutdown(self.inner.config.shutdown_timeout).await?;
        for (name, id) in self.inner.registry.active_entries() {
            self.inner.files.forget(id);
            let _ = name;
        }
        self.inner.registry.close()
    }

    pub async fn delete_all(&self) -> Result<()> {
        for (name, id) in self.inner.registry.active_entries() {
            self.inner.files.layer().delete(&name).await.ok();
            self.inner.files.forget(id);
        }
        self.inner.registry.close()?;
        self.flusher.shutdown(self.inner.config.shutdown_timeout).await
    }

    // -- load / store (§4.4.1, §4.4.2) ------------------------------------

    #[instrument(skip(self))]
    pub async fn load(
        &self,
        file_id: FileId,
        start_page: PageIndex,
        page_count: usize,
        add_new_pages: bool,
    ) -> Result<Vec<Arc<CachePointer>>> {
        if page_count < 1 {
            return Err(CacheError::InvalidArgument("page_count must be >= 1".into()));
        }

        let key = PageKey::new(file_id, start_page);
        {
            let _guard = self.inner.locks.acquire_shared(key);
            if let Some(ptr) = self.inner.directory.get(key) {
                ptr.increment_readers();
                return Ok(vec![ptr]);
            }
        }

        let keys: Vec<PageKey> =
            (0..page_count as i64).map(|i| PageKey::new(file_id, start_page + i)).collect();
        let _guards = self.inner.locks.acquire_shared_batch(&keys);

        let handle = self.inner.files.acquire(file_id).await?;
        let file_size = handle.size().await?;
        let page_size = self.inner.config.page_size as u64;

        if (start_page as u64) * page_size < file_size {
            let available =
                ((file_size - (start_page as u64) * page_size) / page_size) as usize;
            let to_read = page_count.min(available.max(1));
            let mut results = Vec::with_capacity(to_read);
            for i in 0..to_read {
                let key = PageKey::new(file_id, start_page + i as i64);
                let mut buf = self.inner.pool.acquire(false);
                handle
                    .read((start_page as u64 + i as u64) * page_size, buf.as_mut_slice())
                    .await?;
                let fresh = CachePointer::new(file_id, key.page_index, buf);
                let (resident, _inserted) = self.inner.directory.insert_if_absent(key, fresh);
                resident.increment_readers();
                results.push(resident);
            }
            return Ok(results);
        }

        drop(_guards);
        if !add_new_pages {
            return Ok(Vec::new());
        }

        // Allocation path (§4.4.1 step 6).
        let allocation_start = (file_size / page_size) as i64;
        let allocation_stop = start_page;
        let alloc_keys: Vec<PageKey> = (allocation_start..=allocation_stop.max(allocation_start))
            .map(|i| PageKey::new(file_id, i))
            .collect();
        let _alloc_guards = self.inner.locks.acquire_exclusive_batch(&alloc_keys);

        let required_bytes = ((allocation_stop - allocation_start + 1).max(0) as u64) * page_size;
        handle.allocate(required_bytes).await?;

        let mut result = None;
        for key in &alloc_keys {
            let buf = self.inner.pool.acquire(true);
            let ptr = CachePointer::new(file_id, key.page_index, buf);
            ptr.set_not_flushed(true);
            self.inner.directory.incr_not_flushed();
            let (resident, inserted) = self.inner.directory.insert_if_absent(*key, ptr);
            if inserted {
                // Mirrors `store`'s `do_put`: a pointer only ever lives in
                // `write_cache_pages` with `writers_count >= 1` and
                // `in_write_cache = true` (spec.md §3 invariants). Attaching
                // the listener (rather than calling `add_exclusive`
                // directly) is what keeps `exclusive_write_pages` in sync
                // with the pointer's own readers/writers state.
                resident.attach_writers_listener(self.writers_listener());
                resident.increment_writers();
                resident.set_in_write_cache(true);
            }
            if key.page_index == start_page {
                result = Some(resident);
            }
        }

        self.bump_new_pages(alloc_keys.len() as u64).await;

        match result {
            Some(ptr) => {
                ptr.increment_readers();
                Ok(vec![ptr])
            }
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self, ptr))]
    pub async fn store(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        ptr: Arc<CachePointer>,
    ) -> Result<Option<Arc<crate::flusher::Latch>>> {
        let key = PageKey::new(file_id, page_index);
        {
            let _guard = self.inner.locks.acquire_exclusive(key);
            match self.inner.directory.get(key) {
                None => {
                    ptr.attach_writers_listener(self.writers_listener());
                    ptr.increment_writers();
                    ptr.set_in_write_cache(true);
                    self.inner.directory.insert_if_absent(key, ptr.clone());
                }
                Some(existing) => {
                    debug_assert!(Arc::ptr_eq(&existing, &ptr), "store must be idempotent");
                }
            }
        }

        self.update_dirty_pages_table(&ptr).await;

        let max = self.inner.config.exclusive_write_cache_max_size as f64;
        let current = self.inner.directory.exclusive_count() as f64;
        if current / max <= self.inner.config.exclusive_high_water {
            return Ok(None);
        }

        let (latch, installed) = self.inner.latch_slot.existing_or_install();
        if installed {
            let flusher = self.flusher.clone();
            tokio::spawn(async move {
                let _ = flusher.flush_all().await;
            });
        }
        Ok(Some(latch))
    }

    fn writers_listener(&self) -> Arc<dyn WritersListener> {
        Arc::new(CacheWritersListener { inner: Arc::downgrade(&self.inner) })
    }

    /// §4.4: "if no WAL or pointer is already in write cache, no-op;
    /// otherwise insert `(key, wal.end())` if absent."
    async fn update_dirty_pages_table(&self, ptr: &Arc<CachePointer>) {
        let Some(wal) = &self.inner.wal else { return };
        let key = ptr.key();
        let lsn = wal.end().await;
        self.inner.directory.mark_dirty_if_absent(key, lsn);
    }

    async fn bump_new_pages(&self, added: u64) {
        let total = self.inner.amount_of_new_pages_added.fetch_add(added, Ordering::AcqRel) + added;
        let last = self.inner.last_free_space_check.load(Ordering::Acquire);
        if last == 0 || total - last > self.inner.config.free_space_check_interval {
            self.check_free_space().await;
            self.inner.last_free_space_check.store(total, Ordering::Release);
        }
    }

    async fn check_free_space(&self) {
        let registry_path = self.inner.registry.path();
        let dir = registry_path.parent().unwrap_or(&registry_path);
        let Ok(stats) = fs4::available_space(dir) else { return };
        let not_flushed_bytes =
            self.inner.directory.not_flushed_count() as u64 * self.inner.config.page_size as u64;
        if stats.saturating_sub(not_flushed_bytes) < self.inner.config.free_space_limit {
            self.inner.events.emit_low_disk_space(stats, self.inner.config.free_space_limit);
        }
    }

    // -- flush / checkpoint operations -------------------------------------

    pub async fn flush(&self, file_id: FileId) -> Result<()> {
        self.flusher.flush_file(file_id).await
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.flusher.flush_all().await
    }

    pub async fn flush_till_segment(&self, segment: i64) -> Result<()> {
        self.flusher.flush_till_segment(segment).await
    }

    pub async fn make_fuzzy_checkpoint(&self, _segment: i64) -> Result<(Lsn, Lsn)> {
        let Some(wal) = &self.inner.wal else {
            return Err(CacheError::InvalidArgument("no WAL configured".into()));
        };
        let start = wal.log_fuzzy_checkpoint_start().await;
        self.flush_all().await?;
        let end = wal.log_fuzzy_checkpoint_end().await;
        Ok((start, end))
    }

    // -- introspection (§4.4 public API, supplemented) ---------------------

    pub fn get_filled_up_to(&self, file_id: FileId) -> PageIndex {
        self.inner
            .directory
            .file_range(file_id)
            .last()
            .map(|(key, _)| key.page_index + 1)
            .unwrap_or(0)
    }

    pub fn get_minimal_not_flushed_lsn(&self) -> Option<Lsn> {
        self.inner
            .directory
            .snapshot()
            .iter()
            .filter_map(|(key, _)| self.inner.directory.dirty_lsn(*key))
            .min()
    }

    /// Cache-wide stats snapshot — supplements spec.md with a single
    /// observability hook instead of scattering counters across the API.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            write_cache_size: self.inner.directory.write_cache_size(),
            exclusive_write_cache_size: self.inner.directory.exclusive_count(),
            not_flushed_pages: self.inner.directory.not_flushed_count(),
            dirty_pages: self.inner.directory.dirty_count(),
        }
    }

    pub async fn verify(
        &self,
        listener: Option<&dyn VerifyListener>,
    ) -> Result<Vec<PageIntegrityError>> {
        self.flush_all().await?;
        let live = self.inner.registry.active_entries();
        check_stored_pages(&self.inner.files, &live, self.inner.config.page_size, listener).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub write_cache_size: usize,
    pub exclusive_write_cache_size: usize,
    pub not_flushed_pages: usize,
    pub dirty_pages: usize,
}

/// `WOWCache`'s own [`WritersListener`] implementation, attached to every
/// pointer it hands out via `store`. Holds only a weak reference so a
/// pointer outliving its cache can't keep it alive.
struct CacheWritersListener {
    inner: Weak<Inner>,
}

impl WritersListener for CacheWritersListener {
    fn add_only_writers(&self, file_id: FileId, page_index: PageIndex) {
        if let Some(inner) = self.inner.upgrade() {
            inner.directory.add_exclusive(PageKey::new(file_id, page_index));
            info!(file_id, page_index, "page became exclusive");
        }
    }

    fn remove_only_writers(&self, file_id: FileId, page_index: PageIndex) {
        if let Some(inner) = self.inner.upgrade() {
            inner.directory.remove_exclusive(PageKey::new(file_id, page_index));
        }
    }
}
