//! The single dedicated flushing worker (spec.md §4.5).
//!
//! One `tokio::spawn`'d task owns all flush-local state (`local_dirty_pages`,
//! the ring cursor over `exclusive_write_pages`) without any lock, and is
//! driven by a `tokio::time::interval` tick `select!`'d against an incoming
//! command channel, so the directory and its dirty-page table stay free of
//! a dedicated flusher lock. Chunk writes go out as one vectored write per
//! physically adjacent run of pages.

use crate::buffer_pool::{Buffer, BufferPool};
use crate::directory::PageDirectory;
use crate::error::{CacheError, Result};
use crate::events::EventHub;
use crate::file_io::OpenFileContainer;
use crate::locks::PartitionedPageLocks;
use crate::page_format;
use crate::page_key::{FileId, PageKey};
use crate::pointer::CachePointer;
use crate::wal::{Lsn, Wal};
use crate::config::CacheConfig;

use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// A one-shot overflow signal handed back from `store` when the exclusive
/// write cache crosses its high-water mark. Callers `.wait()` before
/// issuing more stores; the flusher completes it once pressure subsides
/// below `exclusive_low_water` (spec.md §4.4.2, §4.5.3).
pub struct Latch {
    notify: Notify,
    done: AtomicBool,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self { notify: Notify::new(), done: AtomicBool::new(false) })
    }

    pub async fn wait(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.notify.notified().await;
    }

    fn complete(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// The single current overflow latch, if any. Shared between `store` (which
/// installs it) and the flusher (which releases it).
pub struct LatchSlot {
    current: SyncMutex<Option<Arc<Latch>>>,
}

impl LatchSlot {
    pub fn new() -> Self {
        Self { current: SyncMutex::new(None) }
    }

    /// Returns the existing latch if one is installed; otherwise installs a
    /// fresh one and reports that this call was the installer.
    pub fn existing_or_install(&self) -> (Arc<Latch>, bool) {
        let mut guard = self.current.lock();
        if let Some(latch) = guard.as_ref() {
            return (latch.clone(), false);
        }
        let latch = Latch::new();
        *guard = Some(latch.clone());
        (latch, true)
    }

    pub fn release(&self) {
        if let Some(latch) = self.current.lock().take() {
            latch.complete();
        }
    }
}

impl Default for LatchSlot {
    fn default() -> Self {
        Self::new()
    }
}

enum FlushCommand {
    FlushFile(FileId, oneshot::Sender<Result<()>>),
    RemoveFilePages(FileId, oneshot::Sender<Result<()>>),
    FlushTillSegment(i64, oneshot::Sender<Result<()>>),
    FlushAll(oneshot::Sender<Result<()>>),
}

struct Shared {
    directory: Arc<PageDirectory>,
    locks: Arc<PartitionedPageLocks>,
    files: Arc<OpenFileContainer>,
    pool: Arc<dyn BufferPool>,
    wal: Option<Arc<dyn Wal>>,
    config: CacheConfig,
    events: Arc<EventHub>,
    latch_slot: Arc<LatchSlot>,
}

/// A snapshotted, footer-stamped page waiting to be written as part of a
/// chunk (spec.md §4.5.1).
struct QueuedPage {
    key: PageKey,
    ptr: Arc<CachePointer>,
    version: u64,
    copy: Buffer,
}

pub struct Flusher {
    command_tx: mpsc::Sender<FlushCommand>,
    shutdown: Arc<Notify>,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl Flusher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        directory: Arc<PageDirectory>,
        locks: Arc<PartitionedPageLocks>,
        files: Arc<OpenFileContainer>,
        pool: Arc<dyn BufferPool>,
        wal: Option<Arc<dyn Wal>>,
        config: CacheConfig,
        events: Arc<EventHub>,
        latch_slot: Arc<LatchSlot>,
    ) -> Self {
        let (command_tx, mut command_rx) = mpsc::channel(64);
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();

        let shared = Arc::new(Shared {
            directory,
            locks,
            files,
            pool,
            wal,
            config: config.clone(),
            events,
            latch_slot,
        });

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.background_flush_interval);
            let mut local_dirty: HashMap<PageKey, Lsn> = HashMap::new();
            let mut local_by_lsn: BTreeMap<Lsn, Vec<PageKey>> = BTreeMap::new();
            let mut ring_cursor: usize = 0;
            let mut lsn_flush_started = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let result = periodic_tick(
                            &shared,
                            &mut local_dirty,
                            &mut local_by_lsn,
                            &mut ring_cursor,
                            &mut lsn_flush_started,
                        ).await;
                        if let Err(e) = result {
                            shared.events.emit_background_exception(&e.to_string());
                        }
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(FlushCommand::FlushFile(id, reply)) => {
                                let _ = reply.send(file_flush_task(&shared, id).await);
                            }
                            Some(FlushCommand::RemoveFilePages(id, reply)) => {
                                let _ = reply.send(remove_file_pages_task(&shared, id).await);
                            }
                            Some(FlushCommand::FlushTillSegment(segment, reply)) => {
                                let r = flush_till_segment_task(
                                    &shared, segment, &mut local_dirty, &mut local_by_lsn, &mut ring_cursor,
                                ).await;
                                let _ = reply.send(r);
                            }
                            Some(FlushCommand::FlushAll(reply)) => {
                                let r = flush_exclusive_if_needed(&shared, &mut ring_cursor).await
                                    .and(flush_by_min_lsn(&shared, &mut local_dirty, &mut local_by_lsn).await);
                                let _ = reply.send(r);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.notified() => break,
                }
            }
            debug!("flusher worker stopped");
        });

        Self { command_tx, shutdown, handle: SyncMutex::new(Some(handle)) }
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> FlushCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| CacheError::Internal("flusher worker is gone".into()))?;
        rx.await.map_err(|_| CacheError::Internal("flusher worker dropped reply".into()))?
    }

    pub async fn flush_file(&self, file_id: FileId) -> Result<()> {
        self.send(|tx| FlushCommand::FlushFile(file_id, tx)).await
    }

    pub async fn remove_file_pages(&self, file_id: FileId) -> Result<()> {
        self.send(|tx| FlushCommand::RemoveFilePages(file_id, tx)).await
    }

    pub async fn flush_till_segment(&self, segment: i64) -> Result<()> {
        self.send(|tx| FlushCommand::FlushTillSegment(segment, tx)).await
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.send(FlushCommand::FlushAll).await
    }

    /// Signal the worker to stop and wait up to `timeout` for it to drain.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_waiters();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => Ok(()),
                Err(_) => Err(CacheError::ShutdownTimeout(timeout)),
            }
        } else {
            Ok(())
        }
    }
}

// -- periodic task (spec.md §4.5, "Periodic task") -----------------------

async fn periodic_tick(
    shared: &Shared,
    local_dirty: &mut HashMap<PageKey, Lsn>,
    local_by_lsn: &mut BTreeMap<Lsn, Vec<PageKey>>,
    ring_cursor: &mut usize,
    lsn_flush_started: &mut bool,
) -> Result<()> {
    if shared.directory.write_cache_size() == 0 {
        return Ok(());
    }

    flush_exclusive_if_needed(shared, ring_cursor).await?;

    if let Some(wal) = &shared.wal {
        let size = wal.size().await;
        if size > shared.config.wal_high_watermark {
            *lsn_flush_started = true;
        } else if size < shared.config.wal_low_watermark {
            *lsn_flush_started = false;
        }
        if *lsn_flush_started {
            flush_by_min_lsn(shared, local_dirty, local_by_lsn).await?;
        }
    }

    Ok(())
}

// -- flush_exclusive_if_needed / flush_exclusive (§4.5, §4.5.3) -----------

async fn flush_exclusive_if_needed(shared: &Shared, ring_cursor: &mut usize) -> Result<()> {
    let max = shared.config.exclusive_write_cache_max_size as f64;
    let threshold = shared.directory.exclusive_count() as f64 / max;

    if threshold > shared.config.exclusive_high_water {
        flush_exclusive(shared, ring_cursor, threshold, max).await
    } else {
        release_exclusive_latch(shared);
        Ok(())
    }
}

async fn flush_exclusive(shared: &Shared, ring_cursor: &mut usize, threshold: f64, max: f64) -> Result<()> {
    let pages_to_flush =
        (((threshold - shared.config.exclusive_high_water) * max).ceil() as usize).max(1);

    let snapshot = shared.directory.exclusive_snapshot();
    if snapshot.is_empty() {
        release_exclusive_latch(shared);
        return Ok(());
    }

    let mut flushed = 0usize;
    let mut scanned = 0usize;
    let mut chunk: Vec<QueuedPage> = Vec::new();
    let mut idx = *ring_cursor % snapshot.len();

    while flushed < pages_to_flush && scanned < snapshot.len() {
        let key = snapshot[idx];
        if let Some(ptr) = shared.directory.get(key) {
            if ptr.is_exclusive() {
                if let Some(item) = snapshot_and_queue(shared, key, &ptr, &mut HashMap::new(), &mut BTreeMap::new()).await? {
                    chunk.push(item);
                    flushed += 1;
                }
            }
        }
        idx = (idx + 1) % snapshot.len();
        scanned += 1;

        if chunk.len() >= shared.config.chunk_size {
            write_chunk(shared, std::mem::take(&mut chunk)).await?;
            release_exclusive_latch(shared);
        }
        if idx == 0 {
            if !chunk.is_empty() {
                write_chunk(shared, std::mem::take(&mut chunk)).await?;
            }
            release_exclusive_latch(shared);
        }
    }
    if !chunk.is_empty() {
        write_chunk(shared, chunk).await?;
    }
    release_exclusive_latch(shared);
    *ring_cursor = idx;
    Ok(())
}

fn release_exclusive_latch(shared: &Shared) {
    let max = shared.config.exclusive_write_cache_max_size as f64;
    let ratio = shared.directory.exclusive_count() as f64 / max;
    if ratio <= shared.config.exclusive_low_water {
        shared.latch_slot.release();
    }
}

// -- flush_by_min_lsn (§4.5) ----------------------------------------------

async fn flush_by_min_lsn(
    shared: &Shared,
    local_dirty: &mut HashMap<PageKey, Lsn>,
    local_by_lsn: &mut BTreeMap<Lsn, Vec<PageKey>>,
) -> Result<()> {
    for (key, lsn) in shared.directory.drain_dirty() {
        if local_dirty.insert(key, lsn).is_none() {
            local_by_lsn.entry(lsn).or_default().push(key);
        }
    }

    let start = Instant::now();
    while start.elapsed() < shared.config.background_flush_interval {
        let seed_key = loop {
            let Some((&lsn, keys)) = local_by_lsn.iter_mut().next() else {
                break None;
            };
            if let Some(key) = keys.pop() {
                if keys.is_empty() {
                    local_by_lsn.remove(&lsn);
                }
                break Some(key);
            }
            local_by_lsn.remove(&lsn);
        };

        let pages = match seed_key {
            Some(key) => shared.directory.tail_from(key),
            None => shared.directory.snapshot(),
        };
        if pages.is_empty() {
            break;
        }

        let mut chunk: Vec<QueuedPage> = Vec::new();
        let mut last_index: Option<(FileId, i64)> = None;

        for (key, ptr) in pages {
            let adjacent = matches!(last_index, Some((file_id, index)) if file_id == key.file_id && key.page_index == index + 1);
            if !chunk.is_empty() && !adjacent {
                write_chunk(shared, std::mem::take(&mut chunk)).await?;
            }
            if let Some(item) = snapshot_and_queue(shared, key, &ptr, local_dirty, local_by_lsn).await? {
                chunk.push(item);
                last_index = Some((key.file_id, key.page_index));
            }
            if chunk.len() >= shared.config.chunk_size {
                write_chunk(shared, std::mem::take(&mut chunk)).await?;
                last_index = None;
            }
        }
        if !chunk.is_empty() {
            write_chunk(shared, chunk).await?;
        }
    }

    release_exclusive_latch(shared);
    Ok(())
}

/// Snapshot-and-queue one page (spec.md §4.5.1). Returns `None` if the page
/// is no longer present or couldn't be captured (content lock contended).
async fn snapshot_and_queue(
    shared: &Shared,
    key: PageKey,
    ptr: &Arc<CachePointer>,
    local_dirty: &mut HashMap<PageKey, Lsn>,
    local_by_lsn: &mut BTreeMap<Lsn, Vec<PageKey>>,
) -> Result<Option<QueuedPage>> {
    let _partition = shared.locks.acquire_shared(key);

    let version = ptr.version();
    let guard = match ptr.try_acquire_shared() {
        Some(guard) => guard,
        None => return Ok(None),
    };
    let mut copy = shared.pool.acquire(false);
    copy.copy_from_slice(guard.as_slice());
    drop(guard);

    page_format::write_footer(copy.as_mut_slice());

    shared.directory.remove_dirty(key);
    if let Some(lsn) = local_dirty.remove(&key) {
        if let Some(keys) = local_by_lsn.get_mut(&lsn) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                local_by_lsn.remove(&lsn);
            }
        }
    }
    ptr.set_in_write_cache(false);

    drop(_partition);

    if let Some(wal) = &shared.wal {
        let (segment, position) = page_format::read_lsn(copy.as_slice());
        let page_lsn = Lsn::new(segment, position);
        if wal.flushed_lsn().await < page_lsn {
            wal.flush().await?;
        }
    }

    Ok(Some(QueuedPage { key, ptr: ptr.clone(), version, copy }))
}

/// Chunk write (spec.md §4.5.2): one vectored write per physically
/// adjacent run, then per-page bookkeeping under the partition's exclusive
/// lock.
async fn write_chunk(shared: &Shared, chunk: Vec<QueuedPage>) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    let file_id = chunk[0].key.file_id;
    let first_index = chunk[0].key.page_index;
    let page_size = chunk[0].copy.len();

    let handle = shared.files.acquire(file_id).await?;
    let slices: Vec<&[u8]> = chunk.iter().map(|item| item.copy.as_slice()).collect();
    let offset = (first_index as u64) * (page_size as u64);

    if let Err(e) = handle.write_vectored(offset, &slices).await {
        shared.events.emit_background_exception(&e.to_string());
        return Err(e);
    }

    for QueuedPage { key, ptr, version, copy } in chunk {
        shared.pool.release(copy);

        let _partition = shared.locks.acquire_exclusive(key);
        if let Some(guard) = ptr.try_acquire_shared() {
            drop(guard);
            if ptr.version() == version {
                shared.directory.remove(key);
                ptr.decrement_writers();
            }
        }
        if ptr.not_flushed() {
            ptr.set_not_flushed(false);
            shared.directory.decr_not_flushed();
        }
    }

    Ok(())
}

// -- other tasks (§4.5.4) --------------------------------------------------

async fn file_flush_task(shared: &Shared, file_id: FileId) -> Result<()> {
    let handle = shared.files.acquire(file_id).await?;
    let page_size = shared.config.page_size;

    for (key, ptr) in shared.directory.file_range(file_id) {
        // Test contention synchronously, then drop the guard before the
        // page's async write — parking_lot guards aren't held across
        // `.await` here (see write_chunk/snapshot_and_queue above).
        if shared.locks.try_acquire_exclusive(key).is_none() {
            continue;
        }

        flush_single_page(shared, &ptr, key, &handle, page_size).await?;

        {
            let _guard = shared.locks.acquire_exclusive(key);
            shared.directory.remove(key);
            ptr.decrement_writers();
        }
        shared.directory.remove_dirty(key);
        if ptr.not_flushed() {
            ptr.set_not_flushed(false);
            shared.directory.decr_not_flushed();
        }
    }

    handle.sync().await?;
    Ok(())
}

async fn remove_file_pages_task(shared: &Shared, file_id: FileId) -> Result<()> {
    for (key, ptr) in shared.directory.file_range(file_id) {
        let _guard = shared.locks.acquire_exclusive(key);
        shared.directory.remove(key);
        shared.directory.remove_dirty(key);
        ptr.decrement_writers();
        if ptr.not_flushed() {
            ptr.set_not_flushed(false);
            shared.directory.decr_not_flushed();
        }
    }
    Ok(())
}

async fn flush_till_segment_task(
    shared: &Shared,
    segment: i64,
    local_dirty: &mut HashMap<PageKey, Lsn>,
    local_by_lsn: &mut BTreeMap<Lsn, Vec<PageKey>>,
    ring_cursor: &mut usize,
) -> Result<()> {
    loop {
        let min_lsn = find_min_dirty_lsn(shared, local_dirty, local_by_lsn);
        match min_lsn {
            Some(lsn) if lsn.segment < segment => {
                flush_exclusive_if_needed(shared, ring_cursor).await?;
                flush_by_min_lsn(shared, local_dirty, local_by_lsn).await?;
            }
            _ => break,
        }
    }
    Ok(())
}

fn find_min_dirty_lsn(
    shared: &Shared,
    local_dirty: &mut HashMap<PageKey, Lsn>,
    local_by_lsn: &mut BTreeMap<Lsn, Vec<PageKey>>,
) -> Option<Lsn> {
    for (key, lsn) in shared.directory.drain_dirty() {
        if local_dirty.insert(key, lsn).is_none() {
            local_by_lsn.entry(lsn).or_default().push(key);
        }
    }
    local_by_lsn.keys().next().copied()
}

async fn flush_single_page(
    shared: &Shared,
    ptr: &Arc<CachePointer>,
    key: PageKey,
    handle: &Arc<dyn crate::file_io::FileHandle>,
    page_size: usize,
) -> Result<()> {
    let guard = ptr.acquire_shared_buffer();
    let mut copy = shared.pool.acquire(false);
    copy.copy_from_slice(guard.as_slice());
    drop(guard);

    page_format::write_footer(copy.as_mut_slice());

    if let Some(wal) = &shared.wal {
        let (segment, position) = page_format::read_lsn(copy.as_slice());
        let lsn = Lsn::new(segment, position);
        if wal.flushed_lsn().await < lsn {
            wal.flush().await?;
        }
    }

    let offset = (key.page_index as u64) * (page_size as u64);
    if let Err(e) = handle.write(offset, copy.as_slice()).await {
        shared.events.emit_background_exception(&e.to_string());
        shared.pool.release(copy);
        return Err(e);
    }
    shared.pool.release(copy);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_slot_installs_once_and_releases() {
        let slot = LatchSlot::new();
        let (latch_a, installed_a) = slot.existing_or_install();
        assert!(installed_a);
        let (_latch_b, installed_b) = slot.existing_or_install();
        assert!(!installed_b);

        let waiter = {
            let latch = latch_a.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        slot.release();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn latch_resets_after_release() {
        let slot = LatchSlot::new();
        let (_latch, installed) = slot.existing_or_install();
        assert!(installed);
        slot.release();
        let (_latch2, installed_again) = slot.existing_or_install();
        assert!(installed_again, "a fresh latch should be installable after release");
    }
}
