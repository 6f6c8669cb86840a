//! Pool and connection error types.

use thiserror::Error;

/// Errors raised by a connection implementation or its factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Could not establish a session with the node.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Tearing down the session failed.
    #[error("destroy failed: {0}")]
    Destroy(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by [`ConnectionPool`](crate::pool::ConnectionPool) operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The factory failed to create a new connection. Pool size is unchanged.
    #[error("failed to create connection via factory '{factory}': {source}")]
    Creation {
        factory: String,
        #[source]
        source: ConnectionError,
    },

    /// No connection became available before the borrow timeout elapsed.
    #[error("pool exhausted: no connection available after {waited_ms}ms (max_size {max_size})")]
    Exhausted { waited_ms: u64, max_size: usize },

    /// The pool has been shut down.
    #[error("pool is closed")]
    Closed,

    /// The pool configuration was rejected.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Returns `true` if the caller may retry the operation (possibly with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Creation { .. } | Self::Exhausted { .. })
    }

    /// Returns `true` if the pool has been shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
