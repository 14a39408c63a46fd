//! Cache error types

use std::sync::Arc;

/// Error returned by host-supplied fetch and mutate functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Underlying failure shared between every caller of one multiplexed fetch
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// `Clone` so that a single fetch outcome can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidCacheKey(Arc<serde_json::Error>),

    #[error("Underlying request failed: {0}")]
    UnderlyingRequestFailure(SharedError),

    #[error("Fetch for group '{group}' was aborted before completing")]
    FetchAborted { group: String },

    #[error("Group '{0}' is already registered")]
    DuplicateGroup(String),

    #[error("Invalid group name: {0:?}")]
    InvalidGroupName(String),

    #[error("Mutating accessor must invalidate at least one group")]
    NoInvalidationTargets,

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Group '{group}' holds values of a different type")]
    GroupTypeMismatch { group: String },

    #[error("Pending entries for group '{group}' can only be installed by a fetch")]
    PendingEntryRejected { group: String },
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::InvalidCacheKey(Arc::new(e))
    }
}

impl CacheError {
    /// Wrap a host function failure for delivery to waiters
    pub(crate) fn underlying(e: BoxError) -> Self {
        CacheError::UnderlyingRequestFailure(Arc::from(e))
    }

    /// The underlying failure, if this error was relayed from a host function
    pub fn underlying_error(&self) -> Option<&SharedError> {
        match self {
            CacheError::UnderlyingRequestFailure(e) => Some(e),
            _ => None,
        }
    }
}
