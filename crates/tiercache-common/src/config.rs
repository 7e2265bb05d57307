//! Configuration types for tiercache
//!
//! This module defines configuration structures used by both cache tiers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default inline threshold for mixed storage mode (20 KiB)
pub const DEFAULT_INLINE_THRESHOLD: usize = 20 * 1024;

/// Root configuration for tiercache
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory tier configuration
    pub memory: MemoryCacheConfig,
    /// Disk tier configuration
    pub disk: DiskCacheConfig,
}

/// Where the storage engine places item values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Every value is a loose file, the catalog only holds metadata
    File,
    /// Every value is stored inside the catalog row
    Inline,
    /// Small values inline, large values as files
    #[default]
    Mixed,
}

/// Memory tier configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Cache name (used in logs)
    pub name: Option<String>,
    /// Maximum number of entries (None = unlimited)
    pub count_limit: Option<usize>,
    /// Maximum total cost (None = unlimited)
    pub cost_limit: Option<u64>,
    /// Maximum time since last access, in seconds (None = unlimited)
    pub age_limit_secs: Option<u64>,
    /// Auto trim interval in milliseconds (0 = disabled)
    pub auto_trim_interval_ms: u64,
    /// Remove every entry when the host reports memory pressure
    pub remove_all_on_memory_pressure: bool,
    /// Remove every entry when the host enters the background
    pub remove_all_on_background: bool,
    /// Drop evicted values on a release thread instead of the caller's
    pub release_asynchronously: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: None,
            count_limit: None,
            cost_limit: None,
            age_limit_secs: None,
            auto_trim_interval_ms: 5000,
            remove_all_on_memory_pressure: true,
            remove_all_on_background: true,
            release_asynchronously: true,
        }
    }
}

impl MemoryCacheConfig {
    /// Age limit as a duration
    #[must_use]
    pub fn age_limit(&self) -> Option<Duration> {
        self.age_limit_secs.map(Duration::from_secs)
    }

    /// Auto trim interval, `None` when disabled
    #[must_use]
    pub const fn auto_trim_interval(&self) -> Option<Duration> {
        if self.auto_trim_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.auto_trim_interval_ms))
        }
    }
}

/// Disk tier configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Storage directory (catalog, data and trash live below it)
    pub path: PathBuf,
    /// Cache name (used in logs)
    pub name: Option<String>,
    /// Value placement mode, fixed for the lifetime of the instance
    pub mode: StorageMode,
    /// Values up to this many bytes are stored inline in mixed mode
    pub inline_threshold: usize,
    /// Maximum number of items (None = unlimited)
    pub count_limit: Option<u64>,
    /// Maximum total stored bytes (None = unlimited)
    pub cost_limit: Option<u64>,
    /// Maximum time since last access, in seconds (None = unlimited)
    pub age_limit_secs: Option<u64>,
    /// Minimum free bytes to keep on the volume (0 = disabled)
    pub free_disk_space_limit: u64,
    /// Auto trim interval in milliseconds (0 = disabled)
    pub auto_trim_interval_ms: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tiercache"),
            name: None,
            mode: StorageMode::Mixed,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            count_limit: None,
            cost_limit: None,
            age_limit_secs: None,
            free_disk_space_limit: 0,
            auto_trim_interval_ms: 60_000,
        }
    }
}

impl DiskCacheConfig {
    /// Create config with storage directory
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Age limit as a duration
    #[must_use]
    pub fn age_limit(&self) -> Option<Duration> {
        self.age_limit_secs.map(Duration::from_secs)
    }

    /// Auto trim interval, `None` when disabled
    #[must_use]
    pub const fn auto_trim_interval(&self) -> Option<Duration> {
        if self.auto_trim_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.auto_trim_interval_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.disk.mode, StorageMode::Mixed);
        assert_eq!(config.disk.inline_threshold, 20 * 1024);
        assert_eq!(config.memory.count_limit, None);
        assert_eq!(
            config.memory.auto_trim_interval(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.disk.auto_trim_interval(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_zero_interval_disables_auto_trim() {
        let config = MemoryCacheConfig {
            auto_trim_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.auto_trim_interval(), None);
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: Config =
            serde_json::from_str(r#"{"disk": {"mode": "inline", "count_limit": 10}}"#).unwrap();
        assert_eq!(config.disk.mode, StorageMode::Inline);
        assert_eq!(config.disk.count_limit, Some(10));
        assert_eq!(config.disk.inline_threshold, DEFAULT_INLINE_THRESHOLD);
        assert!(config.memory.release_asynchronously);
    }
}
