//! The file layer is an external collaborator (spec.md §1): the cache only
//! ever talks to it through `FileHandle`/`FileLayer`, and only through the
//! bounded [`OpenFileContainer`], which is the sole thing allowed to call
//! into the layer (spec.md §5, "shared-resource policy").
//!
//! The reference implementation is a plain `FileHandle` newtype around
//! read/write/sync calls with per-file stats, backed by an `lru::LruCache`
//! for the bounded open-file container.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One open file. All methods take `&self` — callers serialize access
/// themselves (the cache does so via per-key partition locks plus the
/// container's own per-handle mutex for the underlying `std::fs::File`).
#[async_trait]
pub trait FileHandle: Send + Sync {
    async fn size(&self) -> Result<u64>;
    async fn allocate(&self, additional_bytes: u64) -> Result<()>;
    async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;
    async fn write_vectored(&self, offset: u64, bufs: &[&[u8]]) -> Result<()>;
    async fn sync(&self) -> Result<()>;
}

/// Directory-scoped operations: open/close/rename/delete/exists act on a
/// name within one managed directory, not on an already-open handle.
#[async_trait]
pub trait FileLayer: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn FileHandle>>;
    async fn close(&self, name: &str) -> Result<()>;
    async fn rename(&self, old: &str, new: &str) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn exists(&self, name: &str) -> Result<bool>;
}

/// `std::fs::File`-backed handle. Reads/writes are positioned explicitly
/// (seek + read/write under a mutex) rather than relying on platform
/// `pread`/`pwrite`, so this type stays portable; production deployments
/// would swap in a platform-specific handle behind the same trait.
pub struct LocalFileHandle {
    file: Mutex<std::fs::File>,
}

impl LocalFileHandle {
    fn open_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl FileHandle for LocalFileHandle {
    async fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    async fn allocate(&self, additional_bytes: u64) -> Result<()> {
        let mut file = self.file.lock();
        let current = file.metadata()?.len();
        file.set_len(current + additional_bytes)?;
        Ok(())
    }

    async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < buf.len() {
            match file.read(&mut buf[read_total..])? {
                0 => break,
                n => read_total += n,
            }
        }
        Ok(read_total)
    }

    async fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    async fn write_vectored(&self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        for buf in bufs {
            file.write_all(buf)?;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Filesystem-backed [`FileLayer`]: all managed files live under one
/// directory, keyed by name (spec.md §6).
pub struct LocalFileLayer {
    dir: PathBuf,
}

impl LocalFileLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[async_trait]
impl FileLayer for LocalFileLayer {
    async fn open(&self, name: &str) -> Result<Arc<dyn FileHandle>> {
        Ok(Arc::new(LocalFileHandle::open_at(&self.path_for(name))?))
    }

    async fn close(&self, _name: &str) -> Result<()> {
        // Dropping the last `Arc<dyn FileHandle>` closes the underlying fd;
        // nothing extra to do for a std::fs::File-backed handle.
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        std::fs::rename(self.path_for(old), self.path_for(new))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.path_for(name))?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path_for(name).exists())
    }
}

/// Bounded LRU of open file handles keyed by internal file id, guaranteeing
/// mutual exclusion while a handle is held: every site that touches the
/// file layer acquires the guard, uses it, and drops it (spec.md §1, §5 —
/// "the open-file container owns all file handles and is the only entity
/// that may call the file layer").
pub struct OpenFileContainer {
    layer: Arc<dyn FileLayer>,
    cache: Mutex<LruCache<i32, Arc<dyn FileHandle>>>,
    names: Mutex<std::collections::HashMap<i32, String>>,
}

impl OpenFileContainer {
    pub fn new(layer: Arc<dyn FileLayer>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            layer,
            cache: Mutex::new(LruCache::new(capacity)),
            names: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Associate a file id with the name used to open it. Call this once
    /// when the registry hands out or revives an id.
    pub fn register_name(&self, file_id: i32, name: String) {
        self.names.lock().insert(file_id, name);
    }

    pub fn forget(&self, file_id: i32) {
        self.names.lock().remove(&file_id);
        self.cache.lock().pop(&file_id);
    }

    /// Acquire the open handle for `file_id`, opening it through the file
    /// layer on a cache miss. Evicts the least-recently-used handle if the
    /// container is at capacity.
    pub async fn acquire(&self, file_id: i32) -> Result<Arc<dyn FileHandle>> {
        if let Some(handle) = self.cache.lock().get(&file_id).cloned() {
            return Ok(handle);
        }

        let name = self
            .names
            .lock()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| CacheError::UnknownFile(file_id.to_string()))?;

        let handle = self.layer.open(&name).await?;
        self.cache.lock().put(file_id, handle.clone());
        Ok(handle)
    }

    pub fn layer(&self) -> &Arc<dyn FileLayer> {
        &self.layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_file_handle_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let layer = LocalFileLayer::new(dir.path());
        let handle = layer.open("a.dat").await.unwrap();
        handle.allocate(4096).await.unwrap();
        handle.write(0, &[7u8; 128]).await.unwrap();

        let mut buf = vec![0u8; 128];
        handle.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![7u8; 128]);
        assert_eq!(handle.size().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn rename_preserves_contents() {
        let dir = tempdir().unwrap();
        let layer = LocalFileLayer::new(dir.path());
        let handle = layer.open("old.dat").await.unwrap();
        handle.write(0, b"hello").await.unwrap();
        drop(handle);

        layer.rename("old.dat", "new.dat").await.unwrap();
        assert!(!layer.exists("old.dat").await.unwrap());
        assert!(layer.exists("new.dat").await.unwrap());

        let handle = layer.open("new.dat").await.unwrap();
        let mut buf = vec![0u8; 5];
        handle.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn open_file_container_evicts_lru() {
        let dir = tempdir().unwrap();
        let layer = Arc::new(LocalFileLayer::new(dir.path()));
        let container = OpenFileContainer::new(layer, 1);

        container.register_name(1, "one.dat".into());
        container.register_name(2, "two.dat".into());

        let _ = container.acquire(1).await.unwrap();
        let _ = container.acquire(2).await.unwrap();
        assert_eq!(container.cache.lock().len(), 1);
    }

    #[tokio::test]
    async fn acquire_unknown_file_errors() {
        let dir = tempdir().unwrap();
        let layer = Arc::new(LocalFileLayer::new(dir.path()));
        let container = OpenFileContainer::new(layer, 4);
        assert!(container.acquire(99).await.is_err());
    }
}
