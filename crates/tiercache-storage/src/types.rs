//! Item types returned by the storage engine

/// Catalog metadata for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    /// Cache key
    pub key: String,
    /// Blob filename, `None` when the value is stored inline
    pub filename: Option<String>,
    /// Length of the value in bytes
    pub size: u64,
    /// Last write, unix seconds
    pub mod_time: i64,
    /// Last read or write, unix seconds
    pub access_time: i64,
    /// Opaque bytes attached to the item, independent of the value
    pub extended_data: Option<Vec<u8>>,
}

/// A stored item with its value materialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageItem {
    pub info: ItemInfo,
    pub value: Vec<u8>,
}

/// Raw catalog row: metadata plus the inline value, if any
#[derive(Debug, Clone)]
pub(crate) struct CatalogRow {
    pub info: ItemInfo,
    pub inline_value: Option<Vec<u8>>,
}
