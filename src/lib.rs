//! Write-back page cache for a paginated, write-ahead-logged storage engine.
//!
//! See `DESIGN.md` for the design rationale behind each module, and
//! `SPEC_FULL.md` for the full set of requirements this crate implements.

pub mod buffer_pool;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod file_io;
pub mod flusher;
pub mod locks;
pub mod page_format;
pub mod page_key;
pub mod pointer;
pub mod registry;
pub mod verify;
pub mod wal;

pub use cache::{CacheStats, WOWCache};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
