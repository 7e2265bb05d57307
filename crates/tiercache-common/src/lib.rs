//! tiercache Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! key/filename types used by the memory tier, the storage engine and the
//! disk tier.

pub mod clock;
pub mod config;
pub mod error;
pub mod ticker;
pub mod types;

pub use config::{Config, DiskCacheConfig, MemoryCacheConfig, StorageMode};
pub use error::{Error, Result};
pub use ticker::Ticker;
pub use types::{BlobName, KeyError, validate_key};
