//! Error type for storage engine operations

use tiercache_common::KeyError;

/// Error type for storage engine operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Common(#[from] tiercache_common::Error),
    #[error("explicit filename given to an inline-only storage")]
    InlineFilename,
    #[error("blob file missing: {filename}")]
    FileMissing { filename: String },
}

impl From<KeyError> for StorageError {
    fn from(e: KeyError) -> Self {
        Self::Common(e.into())
    }
}

impl StorageError {
    /// Check if this error is the caller's fault rather than the storage's
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        match self {
            Self::Common(e) => e.is_contract_violation(),
            Self::InlineFilename => true,
            Self::Sqlite(_) | Self::Io(_) | Self::FileMissing { .. } => false,
        }
    }

    /// Check if this error means a blob or directory was missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::FileMissing { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Common(e) => e.is_not_found(),
            Self::Sqlite(_) | Self::InlineFilename => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
