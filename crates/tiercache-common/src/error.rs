//! Error types for tiercache
//!
//! This module defines the common error types shared by the cache tiers.

use crate::types::KeyError;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for tiercache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tiercache
#[derive(Debug, Error)]
pub enum Error {
    // Caller contract violations
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid storage path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this error is the caller's fault rather than the storage's
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_) | Self::InvalidPath(_) | Self::InvalidArgument(_)
        )
    }

    /// Check if this error means a file or directory was missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation() {
        assert!(Error::InvalidKey(KeyError::Empty).is_contract_violation());
        assert!(Error::InvalidPath(PathBuf::new()).is_contract_violation());
        assert!(Error::invalid_argument("bad name").is_contract_violation());
        assert!(!Error::Io(std::io::Error::other("eio")).is_contract_violation());
    }

    #[test]
    fn test_not_found() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::Io(missing).is_not_found());
        assert!(!Error::Io(std::io::Error::other("eio")).is_not_found());
        assert!(!Error::invalid_argument("gone").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidPath(PathBuf::from("/nope"));
        assert_eq!(err.to_string(), "invalid storage path: /nope");
        assert_eq!(
            Error::from(KeyError::Empty).to_string(),
            "invalid key: key must not be empty"
        );
    }
}
