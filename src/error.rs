//! Cache error types

use std::sync::Arc;
use std::time::Duration;

use redis::RedisError;

/// Boxed error returned by a caller-supplied source query.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// Everything except [`CacheError::Source`], [`CacheError::Cancelled`] and
/// [`CacheError::Config`] is swallowed inside the cache and degrades to a miss.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Timeout, refused connection, DNS failure, dropped socket.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed or unexpected response from the remote backend.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// Every configured endpoint has been marked failed.
    #[error("All {0} remote endpoints failed")]
    Exhausted(usize),

    /// The source-of-truth query failed. Shared so every coalesced awaiter
    /// observes the same failure.
    #[error("Source query failed: {0}")]
    Source(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Source query was cancelled or panicked")]
    Cancelled,

    #[error("Invalid cache configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether this error should be recorded in the failover error window.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            CacheError::Connectivity(_) | CacheError::Timeout(_) | CacheError::Exhausted(_)
        )
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, CacheError::Protocol(_))
    }

    pub(crate) fn from_source(err: BoxError) -> Self {
        CacheError::Source(Arc::from(err))
    }
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
        {
            CacheError::Connectivity(e.to_string())
        } else {
            CacheError::Protocol(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
