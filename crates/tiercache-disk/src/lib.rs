//! tiercache Disk - persistent cache tier
//!
//! Wraps the storage engine with the cache-facing policy:
//! - **Trims**: count, cost (total stored bytes), age and a free disk space
//!   floor, run on demand or by a periodic auto trim task
//! - **Serial queue**: callback variants of every operation run on one
//!   worker thread per cache, in submission order
//!
//! ```no_run
//! use tiercache_common::DiskCacheConfig;
//! use tiercache_disk::DiskCache;
//!
//! let cache = DiskCache::open(DiskCacheConfig::with_path("/tmp/tiercache"))?;
//! cache.set("avatar:42", b"...")?;
//! if let Some(entry) = cache.get("avatar:42")? {
//!     assert_eq!(entry.value, b"...");
//! }
//! # Ok::<(), tiercache_storage::StorageError>(())
//! ```

pub mod cache;
mod queue;
pub mod space;

pub use cache::{DiskCache, DiskEntry, FilenameFn};
pub use space::free_disk_space;
