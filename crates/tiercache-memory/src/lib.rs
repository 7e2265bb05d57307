//! tiercache Memory Tier
//!
//! A bounded in-process cache level:
//! - O(1) recency tracking over an index-addressed arena
//! - Count, cost and age bounded trims, evicting least recently used first
//! - Periodic auto trim on a background thread
//! - Memory pressure / backgrounding hooks called by the host
//! - Evicted values optionally dropped on a release thread

pub mod cache;
pub mod lru;
mod release;

pub use cache::{CacheHook, CacheStats, MemoryCache};
pub use lru::{NodeId, RecencyIndex};
