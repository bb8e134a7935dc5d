//! Tunables for the write-back cache.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`crate::cache::WOWCache`] instance.
///
/// Durations are stored in milliseconds in the serialized form so the
/// struct round-trips cleanly through JSON; in memory they're exposed as
/// [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Size of a page, in bytes. Must be greater than 12 (magic + CRC
    /// footer) — configurations at or below that are rejected.
    pub page_size: usize,

    /// High 32 bits combined with an internal file id to form the external
    /// 64-bit id (`external = (storage_id << 32) | internal_id`).
    pub storage_id: u32,

    /// Number of shards in [`crate::locks::PartitionedPageLocks`].
    pub lock_partitions: usize,

    /// Capacity of the bounded open-file LRU container.
    pub open_file_capacity: usize,

    /// Maximum exclusive write-cache size before `store` starts handing out
    /// a latch callers must await.
    pub exclusive_write_cache_max_size: usize,

    /// Fraction of `exclusive_write_cache_max_size` above which the flusher
    /// starts eagerly draining exclusive pages.
    pub exclusive_high_water: f64,

    /// Fraction of `exclusive_write_cache_max_size` at or below which an
    /// overflow latch is released. Documented in spec.md as intentionally
    /// higher than the high water mark, to avoid thrashing.
    pub exclusive_low_water: f64,

    /// WAL size (bytes) above which LSN-ordered flushing starts.
    pub wal_high_watermark: u64,

    /// WAL size (bytes) below which LSN-ordered flushing stops.
    pub wal_low_watermark: u64,

    /// How often the flusher's periodic task runs.
    #[serde(with = "duration_ms")]
    pub background_flush_interval: Duration,

    /// Maximum pages grouped into one vectored write.
    pub chunk_size: usize,

    /// Number of newly-allocated pages between free-space samples.
    pub free_space_check_interval: u64,

    /// Free-space floor (bytes) below which low-space events fire.
    pub free_space_limit: u64,

    /// Upper bound on how long `close_all`/`delete_all` wait for the flush
    /// worker to stop.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

impl CacheConfig {
    /// Validate invariants that can't be expressed in the type system.
    pub fn validate(&self) -> Result<()> {
        if self.page_size <= 12 {
            return Err(CacheError::InvalidArgument(format!(
                "page_size must be > 12, got {}",
                self.page_size
            )));
        }
        if self.lock_partitions == 0 {
            return Err(CacheError::InvalidArgument(
                "lock_partitions must be non-zero".into(),
            ));
        }
        if self.exclusive_high_water <= 0.0 || self.exclusive_high_water >= 1.0 {
            return Err(CacheError::InvalidArgument(
                "exclusive_high_water must be in (0, 1)".into(),
            ));
        }
        if self.exclusive_low_water <= 0.0 || self.exclusive_low_water > 1.0 {
            return Err(CacheError::InvalidArgument(
                "exclusive_low_water must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| CacheError::InvalidArgument(format!("bad config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Internal(format!("failed to serialize config: {e}")))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            storage_id: 0,
            lock_partitions: (num_cpus::get() * 4).next_power_of_two(),
            open_file_capacity: 256,
            exclusive_write_cache_max_size: 4096,
            exclusive_high_water: 0.5,
            exclusive_low_water: 0.85,
            wal_high_watermark: 2 * 1024 * 1024 * 1024,
            wal_low_watermark: 1024 * 1024 * 1024,
            background_flush_interval: Duration::from_millis(500),
            chunk_size: 32,
            free_space_check_interval: 256,
            free_space_limit: 512 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5 * 60),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_page_size() {
        let mut cfg = CacheConfig::default();
        cfg.page_size = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = CacheConfig::default();
        let json = cfg.to_json().unwrap();
        let back = CacheConfig::from_json(&json).unwrap();
        assert_eq!(cfg.page_size, back.page_size);
        assert_eq!(cfg.background_flush_interval, back.background_flush_interval);
    }
}
