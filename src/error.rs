use crate::key::CacheKey;
use std::fmt;
use std::time::Duration;

/// Why a lookup, fetch or persistence operation failed.
///
/// The enum is `Clone` because a single fetch failure is reported to every requester that was
/// waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The fetch did not complete within the configured HTTP timeout.
    #[error("network fetch timed out after {0:?}")]
    NetworkTimeout(Duration),

    /// Connection loss, DNS failure, non-success response and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The bytes were retrieved but could not be turned into a resident value.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("disk I/O error: {0}")]
    DiskIo(String),

    /// The source of record has no resource for the key.
    #[error("not found")]
    NotFound,

    /// A persisted disk index could not be read back.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::DiskIo(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::CorruptIndex(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::CorruptIndex(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Delivered to `on_get_failed`: the key that failed and the structured cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReason {
    key: CacheKey,
    error: CacheError,
}

impl FailedReason {
    pub fn new(key: CacheKey, error: CacheError) -> Self {
        FailedReason { key, error }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn error(&self) -> &CacheError {
        &self.error
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, CacheError::NetworkTimeout(_))
    }
}

impl fmt::Display for FailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "get {} failed: {}", self.key, self.error)
    }
}

impl std::error::Error for FailedReason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
