use thiserror::Error;

use crate::backend::BackendError;

/// Terminal outcome of a failed cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Entry creation collided with another in-flight write for the same key.
    #[error("a conflicting write for this key is in progress")]
    Exists,
    /// No entry for the key, or the entry failed the Vary check.
    #[error("no matching cache entry")]
    NotFound,
    #[error("cache storage failure")]
    Storage,
}

impl CacheError {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheError::Exists => "exists",
            CacheError::NotFound => "not_found",
            CacheError::Storage => "storage",
        }
    }
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound => CacheError::NotFound,
            BackendError::Conflict => CacheError::Exists,
            _ => CacheError::Storage,
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
