//! The write-ahead log is an external collaborator (spec.md §1): the cache
//! drives it (`flush`, `log_fuzzy_checkpoint_*`, `cut_segments_smaller_than`)
//! and reads from it (`end`, `flushed_lsn`, `size`) but never owns it.
//!
//! [`Lsn`] and the trait's method names follow spec.md's glossary and §1
//! exactly. The in-memory stub below tracks flushed-LSN and size with
//! `AtomicU64` counters under a `RwLock`-guarded stats block, with no
//! log-record machinery of its own, since the real WAL is out of scope
//! here — tests only need something that satisfies the trait.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// `(segment, position)`, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn {
    pub segment: i64,
    pub position: i64,
}

impl Lsn {
    pub const ZERO: Lsn = Lsn { segment: 0, position: 0 };

    pub fn new(segment: i64, position: i64) -> Self {
        Self { segment, position }
    }
}

#[async_trait]
pub trait Wal: Send + Sync {
    /// The LSN one past the last record appended.
    async fn end(&self) -> Lsn;

    /// Start a new segment.
    async fn begin(&self, segment: i64);

    /// Force all appended records durable; advances `flushed_lsn` to `end()`.
    async fn flush(&self) -> std::io::Result<()>;

    /// The highest LSN known to be durable.
    async fn flushed_lsn(&self) -> Lsn;

    /// Total on-disk size of the log, in bytes.
    async fn size(&self) -> u64;

    /// Mark the beginning of a fuzzy checkpoint.
    async fn log_fuzzy_checkpoint_start(&self) -> Lsn;

    /// Mark the end of a fuzzy checkpoint, allowing segments before the
    /// matching start marker to be cut.
    async fn log_fuzzy_checkpoint_end(&self) -> Lsn;

    /// Remove log segments strictly smaller than `segment`.
    async fn cut_segments_smaller_than(&self, segment: i64);
}

/// A minimal in-memory WAL stub for tests: every `flush()` call advances
/// `flushed_lsn` to the current `end()`, and `size()` grows monotonically
/// with each simulated append so callers can exercise the §4.5 WAL
/// high/low watermark hysteresis.
pub struct InMemoryWal {
    next_segment: AtomicI64,
    next_position: AtomicI64,
    flushed_segment: AtomicI64,
    flushed_position: AtomicI64,
    size_bytes: AtomicU64,
}

impl InMemoryWal {
    pub fn new() -> Self {
        Self {
            next_segment: AtomicI64::new(0),
            next_position: AtomicI64::new(0),
            flushed_segment: AtomicI64::new(0),
            flushed_position: AtomicI64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }

    /// Simulate appending a record, advancing `end()` and `size()` without
    /// flushing. Tests use this to dirty pages at a known LSN.
    pub fn append(&self, bytes: u64) -> Lsn {
        let segment = self.next_segment.load(Ordering::SeqCst);
        let position = self.next_position.fetch_add(1, Ordering::SeqCst) + 1;
        self.size_bytes.fetch_add(bytes, Ordering::SeqCst);
        Lsn::new(segment, position)
    }
}

impl Default for InMemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Wal for InMemoryWal {
    async fn end(&self) -> Lsn {
        Lsn::new(
            self.next_segment.load(Ordering::SeqCst),
            self.next_position.load(Ordering::SeqCst),
        )
    }

    async fn begin(&self, segment: i64) {
        self.next_segment.store(segment, Ordering::SeqCst);
        self.next_position.store(0, Ordering::SeqCst);
    }

    async fn flush(&self) -> std::io::Result<()> {
        let end = self.end().await;
        self.flushed_segment.store(end.segment, Ordering::SeqCst);
        self.flushed_position.store(end.position, Ordering::SeqCst);
        Ok(())
    }

    async fn flushed_lsn(&self) -> Lsn {
        Lsn::new(
            self.flushed_segment.load(Ordering::SeqCst),
            self.flushed_position.load(Ordering::SeqCst),
        )
    }

    async fn size(&self) -> u64 {
        self.size_bytes.load(Ordering::SeqCst)
    }

    async fn log_fuzzy_checkpoint_start(&self) -> Lsn {
        self.end().await
    }

    async fn log_fuzzy_checkpoint_end(&self) -> Lsn {
        self.end().await
    }

    async fn cut_segments_smaller_than(&self, _segment: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_ordering() {
        assert!(Lsn::new(0, 5) < Lsn::new(1, 0));
        assert!(Lsn::new(1, 0) < Lsn::new(1, 1));
    }

    #[tokio::test]
    async fn flush_catches_up_to_end() {
        let wal = InMemoryWal::new();
        wal.append(100);
        wal.append(100);
        assert!(wal.flushed_lsn().await < wal.end().await);
        wal.flush().await.unwrap();
        assert_eq!(wal.flushed_lsn().await, wal.end().await);
    }
}
