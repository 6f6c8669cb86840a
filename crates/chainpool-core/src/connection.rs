//! Capability traits the pool is generic over.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// A long-lived handle to an external chain node.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` so idle handles can move between
/// Tokio worker threads.
#[async_trait]
pub trait ChainConnection: Send + Sync + 'static {
    /// Cheap liveness check. `false` causes the pool to evict the handle.
    async fn validate(&self) -> bool;

    /// Release the underlying resource. The pool calls this at most once.
    async fn destroy(&mut self) -> Result<(), ConnectionError>;
}

/// Produces new connections on demand.
///
/// The pool never retries a failed `create`; the error is handed to the
/// borrower that triggered it.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: ChainConnection;

    /// Open a new connection.
    async fn create(&self) -> Result<Self::Connection, ConnectionError>;

    /// Identifier used in logs and errors.
    fn name(&self) -> &str {
        "factory"
    }
}

#[async_trait]
impl<C, F> ConnectionFactory for F
where
    C: ChainConnection,
    F: Fn() -> Result<C, ConnectionError> + Send + Sync + 'static,
{
    type Connection = C;

    async fn create(&self) -> Result<C, ConnectionError> {
        (self)()
    }

    fn name(&self) -> &str {
        "fn"
    }
}
