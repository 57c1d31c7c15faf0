mod backend;
mod store;

#[cfg(feature = "aws")]
mod s3;

pub use backend::{checksum, OffloadBackend, DEFAULT_PAYLOAD_PREFIX};
pub use store::{FsObjectStore, MemoryObjectStore, ObjectStore};

#[cfg(feature = "aws")]
pub use s3::{S3ObjectStore, S3StoreConfig};

use stepq_core::FailureKind;
use thiserror::Error;

/// Errors raised by an object-store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("Object store rejected the write: {0}")]
    QuotaExceeded(String),

    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors surfaced by the offload backend.
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Offloaded payload not found: {key}")]
    ObjectNotFound { key: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("Offloaded payload {key} failed verification")]
    ChecksumMismatch { key: String },
}

impl OffloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OffloadError::ObjectNotFound { .. } => FailureKind::ObjectNotFound,
            OffloadError::StorageUnavailable(_) => FailureKind::StorageUnavailable,
            OffloadError::StorageQuotaExceeded(_) => FailureKind::StorageQuotaExceeded,
            OffloadError::ChecksumMismatch { .. } => FailureKind::MalformedMessage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, OffloadError::StorageUnavailable(_))
    }
}

impl From<StoreError> for OffloadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => OffloadError::ObjectNotFound { key },
            StoreError::Unavailable(msg) => OffloadError::StorageUnavailable(msg),
            StoreError::QuotaExceeded(msg) => OffloadError::StorageQuotaExceeded(msg),
            // A key the store cannot even address never resolves.
            StoreError::InvalidKey(key) => OffloadError::ObjectNotFound { key },
        }
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;
