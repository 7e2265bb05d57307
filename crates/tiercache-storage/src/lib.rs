//! tiercache Storage Engine - persistent key-value storage
//!
//! This crate implements the disk side of tiercache:
//! - **Catalog**: SQLite table holding one row per key (metadata, and the
//!   value itself when it is stored inline)
//! - **Blob store**: loose files named after the key's digest
//! - **Engine**: picks inline or file placement per item, keeps the two
//!   consistent, and reconciles orphans on open
//!
//! # Layout
//!
//! ```text
//! <path>/
//! ├── manifest.sqlite     catalog (+ -wal / -shm)
//! ├── data/               blob files
//! └── trash/              directories awaiting background deletion
//! ```
//!
//! # Write Path
//! 1. Write the blob file (file placement only)
//! 2. Upsert the catalog row; on failure delete the file just written
//! 3. Delete any stale file left by the previous placement
//!
//! # Remove Path
//! 1. Delete the catalog row
//! 2. Delete the file; failures are logged and left for the orphan sweep

mod blob;
mod catalog;
mod engine;
mod error;
mod types;

pub use blob::BlobStore;
pub use engine::{KvStorage, KvStorageConfig, Placement, SweepReport, decide_placement};
pub use error::{StorageError, StorageResult};
pub use types::{ItemInfo, StorageItem};
