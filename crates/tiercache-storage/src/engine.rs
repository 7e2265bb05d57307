//! Storage engine
//!
//! Composes the SQLite catalog and the blob store behind one lock. Every
//! public operation takes the lock for its whole duration, so the catalog
//! connection is never used from two threads at once.

use crate::blob::BlobStore;
use crate::catalog::Catalog;
use crate::error::{StorageError, StorageResult};
use crate::types::{CatalogRow, ItemInfo, StorageItem};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tiercache_common::config::DEFAULT_INLINE_THRESHOLD;
use tiercache_common::{BlobName, DiskCacheConfig, Error, StorageMode, validate_key};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CATALOG_FILE: &str = "manifest.sqlite";
const CATALOG_SIDECARS: [&str; 3] = ["manifest.sqlite", "manifest.sqlite-wal", "manifest.sqlite-shm"];

/// Rows examined per round of a fit-to-limit trim
const TRIM_PAGE: usize = 16;

/// Rows removed per progress report in `remove_all_with_progress`
const PROGRESS_PAGE: usize = 32;

/// Storage engine configuration
#[derive(Clone, Debug)]
pub struct KvStorageConfig {
    /// Storage directory
    pub path: PathBuf,
    /// Value placement mode
    pub mode: StorageMode,
    /// Inline threshold for mixed mode, in bytes
    pub inline_threshold: usize,
}

impl KvStorageConfig {
    /// Create config with storage directory and default placement
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: StorageMode::Mixed,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl From<&DiskCacheConfig> for KvStorageConfig {
    fn from(config: &DiskCacheConfig) -> Self {
        Self {
            path: config.path.clone(),
            mode: config.mode,
            inline_threshold: config.inline_threshold,
        }
    }
}

/// Where a single value goes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Stored in the catalog row
    Inline,
    /// Stored as a blob file, the row keeps only the filename
    File,
}

/// Decide the placement of a value of `size` bytes
#[must_use]
pub const fn decide_placement(size: usize, threshold: usize, mode: StorageMode) -> Placement {
    match mode {
        StorageMode::File => Placement::File,
        StorageMode::Inline => Placement::Inline,
        StorageMode::Mixed => {
            if size <= threshold {
                Placement::Inline
            } else {
                Placement::File
            }
        }
    }
}

/// What an orphan sweep repaired
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows deleted because their blob file was gone
    pub missing_files: usize,
    /// Blob files deleted because no row referenced them
    pub orphan_files: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.missing_files == 0 && self.orphan_files == 0
    }
}

struct Inner {
    catalog: Catalog,
    blobs: BlobStore,
}

impl Inner {
    /// Materialize a row's value, repairing the row if its file is unreadable
    fn materialize(&self, row: CatalogRow) -> StorageResult<Option<StorageItem>> {
        let CatalogRow { info, inline_value } = row;
        let value = match &info.filename {
            None => inline_value.unwrap_or_default(),
            Some(filename) => match self.read_blob(filename) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Dropping row {:?}: {}", info.key, e);
                    self.catalog.delete(&info.key)?;
                    return Ok(None);
                }
            },
        };
        Ok(Some(StorageItem { info, value }))
    }

    fn read_blob(&self, filename: &str) -> StorageResult<Vec<u8>> {
        self.blobs.read(filename).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::FileMissing {
                    filename: filename.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn delete_blob(&self, filename: &str) {
        if let Err(e) = self.blobs.delete(filename) {
            warn!("Failed to delete blob {}: {}", filename, e);
        }
    }

    fn remove_all(&self) -> StorageResult<()> {
        self.catalog.delete_all()?;
        self.catalog.checkpoint()?;
        self.blobs.delete_all()?;
        self.blobs.empty_trash_in_background();
        Ok(())
    }
}

/// Persistent key-value storage
///
/// Values are placed inline in the catalog or as blob files according to
/// the configured [`StorageMode`]. The mode and threshold are fixed for the
/// lifetime of the instance.
pub struct KvStorage {
    path: PathBuf,
    mode: StorageMode,
    inline_threshold: usize,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KvStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorage")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("inline_threshold", &self.inline_threshold)
            .finish_non_exhaustive()
    }
}

impl KvStorage {
    /// Open a storage directory, creating it if needed
    ///
    /// A catalog that cannot be opened is treated as corrupt: the directory
    /// contents are moved to the trash and a fresh catalog is created. Rows
    /// and files that disagree are reconciled before returning.
    pub fn open(config: KvStorageConfig) -> StorageResult<Self> {
        let KvStorageConfig {
            path,
            mode,
            inline_threshold,
        } = config;

        if path.as_os_str().is_empty() || path.is_file() {
            return Err(Error::InvalidPath(path).into());
        }
        fs::create_dir_all(&path).map_err(|e| {
            error!("Failed to create storage dir {:?}: {}", path, e);
            Error::InvalidPath(path.clone())
        })?;

        let blobs = BlobStore::open(&path)?;
        let catalog = match Catalog::open(path.join(CATALOG_FILE)) {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("Catalog at {:?} failed to open ({}), resetting storage", path, e);
                reset_files(&path, &blobs)?;
                Catalog::open(path.join(CATALOG_FILE))?
            }
        };
        debug!("Catalog file {:?}", catalog.path());

        let storage = Self {
            path,
            mode,
            inline_threshold,
            inner: Mutex::new(Inner { catalog, blobs }),
        };

        let report = storage.sweep()?;
        if !report.is_clean() {
            info!(
                "Reconciled storage at {:?}: {} rows without files, {} orphan files",
                storage.path, report.missing_files, report.orphan_files
            );
        }
        storage.inner.lock().blobs.empty_trash_in_background();

        info!(
            "Opened storage at {:?} (mode={:?}, items={})",
            storage.path,
            storage.mode,
            storage.count()?
        );
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> StorageMode {
        self.mode
    }

    #[must_use]
    pub const fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    // ---- Save ----

    /// Store `value` under `key`, replacing any previous item
    ///
    /// An explicit `filename` forces file placement and is rejected in
    /// inline mode. Without one, placement follows the mode and the blob is
    /// named after the key's digest.
    pub fn save(
        &self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extra: Option<&[u8]>,
    ) -> StorageResult<()> {
        validate_key(key)?;
        let explicit = filename.map(BlobName::new).transpose()?;
        if explicit.is_some() && self.mode == StorageMode::Inline {
            return Err(StorageError::InlineFilename);
        }
        let placement = if explicit.is_some() {
            Placement::File
        } else {
            decide_placement(value.len(), self.inline_threshold, self.mode)
        };
        let size = value.len() as u64;

        let inner = self.inner.lock();
        let previous = inner.catalog.filename(key)?;

        match placement {
            Placement::File => {
                let name = explicit.unwrap_or_else(|| BlobName::for_key(key));
                // The existing blob stays untouched until the row is in place
                let staged = inner.blobs.stage(value).inspect_err(|e| {
                    error!("Failed to write blob for {:?}: {}", key, e);
                })?;
                if let Err(e) = inner
                    .catalog
                    .upsert(key, None, Some(name.as_str()), size, extra)
                {
                    error!("Failed to save row {:?}: {}", key, e);
                    inner.blobs.discard(&staged);
                    return Err(e.into());
                }
                if let Err(e) = inner.blobs.commit(&staged, name.as_str()) {
                    // The row now describes bytes that never landed
                    error!("Failed to commit blob for {:?}: {}", key, e);
                    if let Err(e) = inner.catalog.delete(key) {
                        warn!("Failed to drop row {:?}: {}", key, e);
                    }
                    if let Some(previous) = previous.as_deref() {
                        inner.delete_blob(previous);
                    }
                    return Err(e.into());
                }
                if let Some(previous) = previous.filter(|p| p != name.as_str()) {
                    inner.delete_blob(&previous);
                }
            }
            Placement::Inline => {
                inner
                    .catalog
                    .upsert(key, Some(value), None, size, extra)
                    .inspect_err(|e| error!("Failed to save row {:?}: {}", key, e))?;
                if let Some(previous) = previous {
                    inner.delete_blob(&previous);
                }
            }
        }
        debug!("Saved {:?} ({} bytes, {:?})", key, size, placement);
        Ok(())
    }

    // ---- Get ----

    /// Item with its value, touching its access time
    pub fn get(&self, key: &str) -> StorageResult<Option<StorageItem>> {
        validate_key(key)?;
        let inner = self.inner.lock();
        let Some(row) = inner.catalog.get(key, true)? else {
            return Ok(None);
        };
        let Some(mut item) = inner.materialize(row)? else {
            return Ok(None);
        };
        item.info.access_time = inner.catalog.touch(key)?;
        Ok(Some(item))
    }

    /// Item metadata only, without touching
    pub fn get_info(&self, key: &str) -> StorageResult<Option<ItemInfo>> {
        validate_key(key)?;
        let inner = self.inner.lock();
        Ok(inner.catalog.get(key, false)?.map(|row| row.info))
    }

    /// Value only, touching its access time
    pub fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|item| item.value))
    }

    /// Items for several keys; missing keys are skipped
    pub fn get_items(&self, keys: &[&str]) -> StorageResult<Vec<StorageItem>> {
        for key in keys {
            validate_key(key)?;
        }
        let inner = self.inner.lock();
        let rows = inner.catalog.get_many(keys, true)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(item) = inner.materialize(row)? {
                items.push(item);
            }
        }
        if !items.is_empty() {
            let found: Vec<&str> = items.iter().map(|item| item.info.key.as_str()).collect();
            let now = inner.catalog.touch_many(&found)?;
            for item in &mut items {
                item.info.access_time = now;
            }
        }
        Ok(items)
    }

    /// Metadata for several keys, without touching
    pub fn get_infos(&self, keys: &[&str]) -> StorageResult<Vec<ItemInfo>> {
        for key in keys {
            validate_key(key)?;
        }
        let inner = self.inner.lock();
        Ok(inner
            .catalog
            .get_many(keys, false)?
            .into_iter()
            .map(|row| row.info)
            .collect())
    }

    /// Values for several keys, keyed by key
    pub fn get_values(&self, keys: &[&str]) -> StorageResult<HashMap<String, Vec<u8>>> {
        Ok(self
            .get_items(keys)?
            .into_iter()
            .map(|item| (item.info.key, item.value))
            .collect())
    }

    // ---- Aggregates ----

    pub fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.inner.lock().catalog.exists(key)?)
    }

    pub fn count(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().catalog.count()?)
    }

    /// Sum of the logical sizes of every stored value
    pub fn total_size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().catalog.total_size()?)
    }

    // ---- Remove ----

    /// Remove one item; a missing key is not an error
    pub fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let inner = self.inner.lock();
        let filename = inner.catalog.filename(key)?;
        inner.catalog.delete(key)?;
        if let Some(filename) = filename {
            inner.delete_blob(&filename);
        }
        Ok(())
    }

    pub fn remove_keys(&self, keys: &[&str]) -> StorageResult<()> {
        for key in keys {
            validate_key(key)?;
        }
        let inner = self.inner.lock();
        let filenames = inner.catalog.filenames(keys)?;
        inner.catalog.delete_many(keys)?;
        inner.blobs.delete_many(&filenames);
        Ok(())
    }

    /// Remove every item whose value is larger than `size` bytes
    pub fn remove_larger_than(&self, size: u64) -> StorageResult<()> {
        if size == u64::MAX {
            return Ok(());
        }
        if size == 0 {
            return self.remove_all();
        }
        let inner = self.inner.lock();
        let filenames = inner.catalog.filenames_larger_than(size)?;
        let removed = inner.catalog.delete_larger_than(size)?;
        inner.blobs.delete_many(&filenames);
        if removed > 0 {
            inner.catalog.checkpoint()?;
        }
        debug!("Removed {} items larger than {} bytes", removed, size);
        Ok(())
    }

    /// Remove every item last accessed before `time` (unix seconds)
    pub fn remove_earlier_than(&self, time: i64) -> StorageResult<()> {
        if time <= 0 {
            return Ok(());
        }
        if time == i64::MAX {
            return self.remove_all();
        }
        let inner = self.inner.lock();
        let filenames = inner.catalog.filenames_earlier_than(time)?;
        let removed = inner.catalog.delete_earlier_than(time)?;
        inner.blobs.delete_many(&filenames);
        if removed > 0 {
            inner.catalog.checkpoint()?;
        }
        debug!("Removed {} items accessed before {}", removed, time);
        Ok(())
    }

    /// Remove least recently accessed items until the total size fits
    pub fn remove_to_fit_size(&self, max_size: u64) -> StorageResult<()> {
        if max_size == u64::MAX {
            return Ok(());
        }
        if max_size == 0 {
            return self.remove_all();
        }
        let inner = self.inner.lock();
        let mut total = inner.catalog.total_size()?;
        let removed = Self::remove_oldest_while(&inner, |size| {
            if total <= max_size {
                return false;
            }
            total = total.saturating_sub(size);
            true
        })?;
        debug!("Trimmed {} items to fit {} bytes", removed, max_size);
        Ok(())
    }

    /// Remove least recently accessed items until the count fits
    pub fn remove_to_fit_count(&self, max_count: u64) -> StorageResult<()> {
        if max_count == u64::MAX {
            return Ok(());
        }
        if max_count == 0 {
            return self.remove_all();
        }
        let inner = self.inner.lock();
        let mut count = inner.catalog.count()?;
        let removed = Self::remove_oldest_while(&inner, |_| {
            if count <= max_count {
                return false;
            }
            count -= 1;
            true
        })?;
        debug!("Trimmed {} items to fit {} items", removed, max_count);
        Ok(())
    }

    /// Walk rows oldest first, removing each one `should_remove` accepts
    ///
    /// Stops at the first row it rejects.
    fn remove_oldest_while(
        inner: &Inner,
        mut should_remove: impl FnMut(u64) -> bool,
    ) -> StorageResult<usize> {
        let mut removed = 0;
        'pages: loop {
            let page = inner.catalog.lru_page(TRIM_PAGE)?;
            if page.is_empty() {
                break;
            }
            for (key, filename, size) in page {
                if !should_remove(size) {
                    break 'pages;
                }
                inner.catalog.delete(&key)?;
                if let Some(filename) = filename {
                    inner.delete_blob(&filename);
                }
                removed += 1;
            }
        }
        if removed > 0 {
            inner.catalog.checkpoint()?;
        }
        Ok(removed)
    }

    /// Remove every item
    pub fn remove_all(&self) -> StorageResult<()> {
        let inner = self.inner.lock();
        inner.remove_all()?;
        info!("Removed all items from {:?}", self.path);
        Ok(())
    }

    /// Remove every item in batches, reporting `(removed, total)` after each
    pub fn remove_all_with_progress(
        &self,
        mut progress: impl FnMut(u64, u64),
    ) -> StorageResult<()> {
        let inner = self.inner.lock();
        let total = inner.catalog.count()?;
        let mut removed = 0u64;
        loop {
            let page = inner.catalog.lru_page(PROGRESS_PAGE)?;
            if page.is_empty() {
                break;
            }
            let keys: Vec<&str> = page.iter().map(|(key, _, _)| key.as_str()).collect();
            let filenames: Vec<&str> = page.iter().filter_map(|(_, f, _)| f.as_deref()).collect();
            inner.blobs.delete_many(&filenames);
            let deleted = inner.catalog.delete_many(&keys)?;
            removed += deleted as u64;
            progress(removed, total);
        }
        inner.remove_all()?;
        info!("Removed all {} items from {:?}", removed, self.path);
        Ok(())
    }

    // ---- Maintenance ----

    /// Reconcile the catalog with the blob directory
    ///
    /// Rows whose file is missing are deleted, then files no row references
    /// (including unfinished temp writes) are deleted.
    pub fn sweep(&self) -> StorageResult<SweepReport> {
        let inner = self.inner.lock();
        let files: HashSet<String> = inner.blobs.list()?.into_iter().collect();

        let mut referenced = HashSet::new();
        let mut dead_rows = Vec::new();
        for (key, filename) in inner.catalog.file_rows()? {
            if files.contains(&filename) {
                referenced.insert(filename);
            } else {
                dead_rows.push(key);
            }
        }
        if !dead_rows.is_empty() {
            warn!("{} rows reference missing blob files", dead_rows.len());
            inner.catalog.delete_many(&dead_rows)?;
        }

        let orphans: Vec<&String> = files.difference(&referenced).collect();
        if !orphans.is_empty() {
            warn!("{} blob files have no row", orphans.len());
            inner.blobs.delete_many(&orphans);
        }

        Ok(SweepReport {
            missing_files: dead_rows.len(),
            orphan_files: orphans.len(),
        })
    }

    #[cfg(test)]
    fn set_access_time(&self, key: &str, time: i64) {
        self.inner.lock().catalog.set_access_time(key, time).unwrap();
    }

    #[cfg(test)]
    fn execute_sql(&self, sql: &str) {
        self.inner.lock().catalog.execute_batch(sql).unwrap();
    }

    #[cfg(test)]
    fn blobs(&self) -> BlobStore {
        self.inner.lock().blobs.clone()
    }
}

/// Move the catalog files and every blob into the trash
fn reset_files(path: &Path, blobs: &BlobStore) -> StorageResult<()> {
    let target = blobs.trash_dir().join(Uuid::new_v4().simple().to_string());
    fs::create_dir_all(&target)?;
    for name in CATALOG_SIDECARS {
        match fs::rename(path.join(name), target.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    blobs.delete_all()?;
    warn!("Reset storage at {:?}", path);
    Ok(())
}
