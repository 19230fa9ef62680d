//! Remote storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Delivery failure, classified by whether another attempt can succeed.
///
/// The classification drives the lifecycle: retryable failures re-queue the
/// segment with backoff, terminal failures mark it failed immediately.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Transient condition (network, throttling, service error). Retry later.
    #[error("retryable upload failure: {0}")]
    Retryable(String),

    /// Permanent condition (bad credentials, invalid key, missing bucket).
    /// Retrying without operator intervention cannot succeed.
    #[error("terminal upload failure: {0}")]
    Terminal(String),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Retryable(_))
    }

    /// Classify an object store error. Credential and path problems are
    /// terminal; everything else (connection resets, 5xx, throttling) is
    /// worth another attempt.
    pub fn from_object_store(err: object_store::Error) -> Self {
        use object_store::Error;
        match err {
            Error::Unauthenticated { .. }
            | Error::PermissionDenied { .. }
            | Error::InvalidPath { .. }
            | Error::NotSupported { .. }
            | Error::UnknownConfigurationKey { .. } => UploadError::Terminal(err.to_string()),
            other => UploadError::Retryable(other.to_string()),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A destination for segment delivery.
///
/// Implementations must make `put` idempotent for a given key: delivering the
/// same segment twice leaves one object with the final content.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Upload the full segment body under `key`, replacing any prior object.
    async fn put(&self, key: &str, data: Bytes) -> UploadResult<()>;

    /// Whether an object already exists under `key`.
    async fn exists(&self, key: &str) -> UploadResult<bool>;

    /// Human-readable destination label for logs ("s3://bucket", a directory).
    fn describe(&self) -> String;
}
