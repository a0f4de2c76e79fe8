use thiserror::Error;
use uuid::Uuid;

use super::keys::RequestIdentity;

/// Failures of the body store medium.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write cache body `{uid}`: {source}")]
    Write {
        uid: Uuid,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read cache body `{uid}`: {source}")]
    Read {
        uid: Uuid,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to delete cache body `{uid}`: {source}")]
    Delete {
        uid: Uuid,
        #[source]
        source: std::io::Error,
    },
    #[error("cache directory operation failed: {0}")]
    Directory(#[source] std::io::Error),
}

/// Failures of the metadata index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index persistence error: {0}")]
    Persistence(String),
    #[error("index query timed out")]
    Timeout,
}

impl IndexError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Errors surfaced by compound cache operations.
///
/// The interceptor logs these and carries on; they never reach the end user.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("no cache entry for `{identity}` after capture began")]
    InconsistentState { identity: RequestIdentity },
    #[error("content behind `{identity}` was invalidated while it rendered")]
    Invalidated { identity: RequestIdentity },
}
