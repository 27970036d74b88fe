use std::fmt;

use crate::CacheKey;

/// The expected failure of a cache read: an object or one of its fields is not in the cache, or
/// is there but too old to be served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMissError {
    pub key: CacheKey,
    /// `None` when the whole object is missing.
    pub field_name: Option<String>,
    pub stale: bool,
}

impl CacheMissError {
    pub fn missing_object(key: CacheKey) -> Self {
        CacheMissError {
            key,
            field_name: None,
            stale: false,
        }
    }

    pub fn missing_field(key: CacheKey, field_name: impl Into<String>) -> Self {
        CacheMissError {
            key,
            field_name: Some(field_name.into()),
            stale: false,
        }
    }

    pub fn stale_field(key: CacheKey, field_name: impl Into<String>) -> Self {
        CacheMissError {
            key,
            field_name: Some(field_name.into()),
            stale: true,
        }
    }
}

impl fmt::Display for CacheMissError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.field_name, self.stale) {
            (None, _) => write!(f, "Object '{}' not found", self.key),
            (Some(field), false) => write!(f, "Object '{}' has no field named '{field}'", self.key),
            (Some(field), true) => write!(f, "Field '{field}' on object '{}' is stale", self.key),
        }
    }
}

impl std::error::Error for CacheMissError {}

/// Failure of a persistent backend. These never reach callers of the cache: they are reported
/// through [`crate::diagnostics`] and the operation is treated as a miss.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Miss(#[from] CacheMissError),
    #[error("Invalid data at '{path}': {message}")]
    InvalidData { path: String, message: String },
}

impl CacheError {
    pub fn as_miss(&self) -> Option<&CacheMissError> {
        match self {
            CacheError::Miss(miss) => Some(miss),
            CacheError::InvalidData { .. } => None,
        }
    }
}
