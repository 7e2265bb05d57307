//! Disk tier
//!
//! A [`KvStorage`] plus mutable limits. Costs on this tier are stored bytes:
//! the cost limit bounds the sum of value sizes, not a caller-supplied cost.
//!
//! # Trim order
//!
//! [`DiskCache::trim`] applies cost, count, age and then the free space
//! floor. Each step removes least recently accessed items first.

use crate::queue::SerialQueue;
use crate::space::free_disk_space;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tiercache_common::clock::unix_timestamp;
use tiercache_common::{DiskCacheConfig, StorageMode, Ticker};
use tiercache_storage::{KvStorage, KvStorageConfig, StorageResult};
use tracing::{debug, error, info, warn};

/// Maps a key to the blob filename used when its value goes to a file
///
/// Returning `None` falls back to the key's digest.
pub type FilenameFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A value read from the disk tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub value: Vec<u8>,
    /// Opaque bytes stored alongside the value
    pub extended_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    count: Option<u64>,
    cost: Option<u64>,
    age: Option<Duration>,
    free_disk_space: u64,
}

struct Inner {
    name: String,
    storage: KvStorage,
    limits: RwLock<Limits>,
    filename_fn: Option<FilenameFn>,
    queue: Option<SerialQueue>,
    trimmer: Mutex<Option<Ticker>>,
}

/// Persistent, size/count/age bounded cache over a storage directory
///
/// Cloning the handle is cheap and shares the same cache. Synchronous
/// methods block on storage I/O; the `*_with` variants run on the cache's
/// serial queue and report through a callback.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("name", &self.inner.name)
            .field("storage", &self.inner.storage)
            .field("limits", &*self.inner.limits.read())
            .finish_non_exhaustive()
    }
}

impl DiskCache {
    /// Open a disk cache and start its auto trim task
    pub fn open(config: DiskCacheConfig) -> StorageResult<Self> {
        Self::open_inner(config, None)
    }

    /// Open a disk cache whose blob files are named by `filename_fn`
    pub fn with_filename_fn(config: DiskCacheConfig, filename_fn: FilenameFn) -> StorageResult<Self> {
        Self::open_inner(config, Some(filename_fn))
    }

    fn open_inner(config: DiskCacheConfig, filename_fn: Option<FilenameFn>) -> StorageResult<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| "disk-cache".to_string());
        let storage = KvStorage::open(KvStorageConfig::from(&config))?;

        let queue = match SerialQueue::spawn(format!("{name}-queue")) {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!("{}: failed to start worker queue, running callbacks inline: {}", name, e);
                None
            }
        };

        let inner = Arc::new(Inner {
            name,
            storage,
            limits: RwLock::new(Limits {
                count: config.count_limit,
                cost: config.cost_limit,
                age: config.age_limit(),
                free_disk_space: config.free_disk_space_limit,
            }),
            filename_fn,
            queue,
            trimmer: Mutex::new(None),
        });

        let cache = Self { inner };
        if let Some(interval) = config.auto_trim_interval() {
            cache.start_auto_trim(interval);
        }
        info!("{}: opened at {:?}", cache.inner.name, cache.path());
        Ok(cache)
    }

    fn start_auto_trim(&self, interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let spawned = Ticker::spawn(format!("{}-trim", self.inner.name), interval, move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let cache = Self { inner };
            if let Err(e) = cache.trim() {
                error!("{}: auto trim failed: {}", cache.inner.name, e);
            }
            true
        });

        match spawned {
            Ok(ticker) => *self.inner.trimmer.lock() = Some(ticker),
            Err(e) => warn!("{}: failed to start auto trim: {}", self.inner.name, e),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Storage directory
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.storage.path()
    }

    /// Underlying storage engine
    #[must_use]
    pub fn storage(&self) -> &KvStorage {
        &self.inner.storage
    }

    // ---- Limits ----

    #[must_use]
    pub fn count_limit(&self) -> Option<u64> {
        self.inner.limits.read().count
    }

    pub fn set_count_limit(&self, limit: Option<u64>) {
        self.inner.limits.write().count = limit;
    }

    #[must_use]
    pub fn cost_limit(&self) -> Option<u64> {
        self.inner.limits.read().cost
    }

    pub fn set_cost_limit(&self, limit: Option<u64>) {
        self.inner.limits.write().cost = limit;
    }

    #[must_use]
    pub fn age_limit(&self) -> Option<Duration> {
        self.inner.limits.read().age
    }

    pub fn set_age_limit(&self, limit: Option<Duration>) {
        self.inner.limits.write().age = limit;
    }

    /// Free bytes the trims try to keep on the volume (0 = disabled)
    #[must_use]
    pub fn free_disk_space_limit(&self) -> u64 {
        self.inner.limits.read().free_disk_space
    }

    pub fn set_free_disk_space_limit(&self, limit: u64) {
        self.inner.limits.write().free_disk_space = limit;
    }

    // ---- Access ----

    /// Check for a key without touching it
    pub fn contains(&self, key: &str) -> StorageResult<bool> {
        self.inner.storage.exists(key)
    }

    /// Read a value and its extended data
    pub fn get(&self, key: &str) -> StorageResult<Option<DiskEntry>> {
        Ok(self.inner.storage.get(key)?.map(|item| DiskEntry {
            value: item.value,
            extended_data: item.info.extended_data,
        }))
    }

    /// Read only the extended data, without touching the item
    pub fn get_extended_data(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .inner
            .storage
            .get_info(key)?
            .and_then(|info| info.extended_data))
    }

    pub fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.set_with_extended_data(key, value, None)
    }

    /// Store a value together with opaque extended data
    pub fn set_with_extended_data(
        &self,
        key: &str,
        value: &[u8],
        extended_data: Option<&[u8]>,
    ) -> StorageResult<()> {
        let filename = self.custom_filename(key, value.len());
        self.inner
            .storage
            .save(key, value, filename.as_deref(), extended_data)
    }

    /// Filename from the filename function, for values that go to a file
    fn custom_filename(&self, key: &str, len: usize) -> Option<String> {
        let filename_fn = self.inner.filename_fn.as_ref()?;
        let storage = &self.inner.storage;
        let file_backed = match storage.mode() {
            StorageMode::File => true,
            StorageMode::Inline => false,
            StorageMode::Mixed => len > storage.inline_threshold(),
        };
        if file_backed { filename_fn(key) } else { None }
    }

    pub fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.storage.remove(key)
    }

    pub fn remove_all(&self) -> StorageResult<()> {
        self.inner.storage.remove_all()
    }

    /// Number of stored items
    pub fn total_count(&self) -> StorageResult<u64> {
        self.inner.storage.count()
    }

    /// Total stored bytes
    pub fn total_cost(&self) -> StorageResult<u64> {
        self.inner.storage.total_size()
    }

    // ---- Trims ----

    pub fn trim_to_count(&self, limit: u64) -> StorageResult<()> {
        self.inner.storage.remove_to_fit_count(limit)
    }

    pub fn trim_to_cost(&self, limit: u64) -> StorageResult<()> {
        self.inner.storage.remove_to_fit_size(limit)
    }

    /// Remove items not accessed within `age`; zero removes everything
    pub fn trim_to_age(&self, age: Duration) -> StorageResult<()> {
        if age.is_zero() {
            return self.inner.storage.remove_all();
        }
        let now = unix_timestamp();
        let age = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        if now <= age {
            return Ok(());
        }
        self.inner.storage.remove_earlier_than(now - age)
    }

    /// Shrink the cache until the volume has `floor` free bytes, if it can
    ///
    /// Only the cache's own items are removed, so the floor may stay unmet.
    pub fn trim_to_free_space(&self, floor: u64) -> StorageResult<()> {
        if floor == 0 {
            return Ok(());
        }
        let total = self.inner.storage.total_size()?;
        if total == 0 {
            return Ok(());
        }
        let free = free_disk_space(self.path())?;
        let deficit = floor.saturating_sub(free);
        if deficit == 0 {
            return Ok(());
        }
        debug!(
            "{}: {} bytes free, {} below the floor",
            self.inner.name, free, deficit
        );
        self.inner.storage.remove_to_fit_size(total.saturating_sub(deficit))
    }

    /// Apply every configured limit
    ///
    /// All steps run even if one fails; the first failure is returned.
    pub fn trim(&self) -> StorageResult<()> {
        let limits = *self.inner.limits.read();
        let mut first_error = None;
        let mut record = |result: StorageResult<()>| {
            if let Err(e) = result {
                warn!("{}: trim step failed: {}", self.inner.name, e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(cost) = limits.cost {
            record(self.trim_to_cost(cost));
        }
        if let Some(count) = limits.count {
            record(self.trim_to_count(count));
        }
        if let Some(age) = limits.age {
            record(self.trim_to_age(age));
        }
        record(self.trim_to_free_space(limits.free_disk_space));

        first_error.map_or(Ok(()), Err)
    }

    // ---- Queued variants ----

    fn submit(&self, job: impl FnOnce(&Self) + Send + 'static) {
        let cache = self.clone();
        let job: Box<dyn FnOnce() + Send> = Box::new(move || job(&cache));
        match &self.inner.queue {
            Some(queue) => queue.submit(job),
            None => job(),
        }
    }

    pub fn get_with(
        &self,
        key: impl Into<String>,
        done: impl FnOnce(StorageResult<Option<DiskEntry>>) + Send + 'static,
    ) {
        let key = key.into();
        self.submit(move |cache| done(cache.get(&key)));
    }

    pub fn set_with(
        &self,
        key: impl Into<String>,
        value: Vec<u8>,
        extended_data: Option<Vec<u8>>,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        let key = key.into();
        self.submit(move |cache| {
            done(cache.set_with_extended_data(&key, &value, extended_data.as_deref()));
        });
    }

    pub fn remove_with(
        &self,
        key: impl Into<String>,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        let key = key.into();
        self.submit(move |cache| done(cache.remove(&key)));
    }

    pub fn contains_with(
        &self,
        key: impl Into<String>,
        done: impl FnOnce(StorageResult<bool>) + Send + 'static,
    ) {
        let key = key.into();
        self.submit(move |cache| done(cache.contains(&key)));
    }

    pub fn remove_all_with(&self, done: impl FnOnce(StorageResult<()>) + Send + 'static) {
        self.submit(move |cache| done(cache.remove_all()));
    }

    /// Remove everything in batches, reporting `(removed, total)` as it goes
    pub fn remove_all_with_progress(
        &self,
        progress: impl FnMut(u64, u64) + Send + 'static,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        self.submit(move |cache| {
            done(cache.inner.storage.remove_all_with_progress(progress));
        });
    }

    pub fn trim_to_count_with(
        &self,
        limit: u64,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        self.submit(move |cache| done(cache.trim_to_count(limit)));
    }

    pub fn trim_to_cost_with(
        &self,
        limit: u64,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        self.submit(move |cache| done(cache.trim_to_cost(limit)));
    }

    pub fn trim_to_age_with(
        &self,
        age: Duration,
        done: impl FnOnce(StorageResult<()>) + Send + 'static,
    ) {
        self.submit(move |cache| done(cache.trim_to_age(age)));
    }
}
