//! Core type definitions for tiercache
//!
//! Key validation and the deterministic key to blob filename mapping.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Error returned when a cache key is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key must not be empty")]
    Empty,
}

/// Validate a cache key
///
/// Any non-empty string is a valid key. The key is never interpreted beyond
/// this check; the filename derived from it is always filesystem safe.
pub const fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(())
}

/// Name of a loose blob file inside the storage data directory
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BlobName(String);

impl BlobName {
    /// Derive the blob name for a key
    ///
    /// The name is the lowercase hex SHA-256 of the key, so it is stable
    /// across restarts and collision resistant.
    #[must_use]
    pub fn for_key(key: &str) -> Self {
        Self(hex::encode(Sha256::digest(key.as_bytes())))
    }

    /// Wrap a caller supplied filename
    ///
    /// Rejects names that would escape the data directory.
    pub fn new(name: impl Into<String>) -> Result<Self, crate::Error> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(crate::Error::invalid_argument(format!(
                "invalid blob filename: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Get the filename as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobName({})", self.0)
    }
}

impl AsRef<str> for BlobName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
