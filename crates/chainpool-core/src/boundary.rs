//! Error normalization at the resolver boundary.
//!
//! Resolver code can fail with any error type. Callers outside the resolver
//! layer only ever see a [`DataFetchingError`] carrying the original message;
//! the full error is logged here together with the failing call's signature.

use std::future::Future;

use thiserror::Error;

/// The single error kind surfaced by the resolver boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DataFetchingError {
    pub message: String,
}

impl DataFetchingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Log `error` against `signature` and normalize it.
pub fn translate_error<E>(signature: &str, error: &E) -> DataFetchingError
where
    E: std::error::Error + ?Sized,
{
    tracing::error!(signature, "resolver call failed");
    tracing::error!(signature, error = %error, "exception");
    tracing::error!(signature, detail = ?error, "error detail");
    DataFetchingError::new(error.to_string())
}

/// Await a resolver call and normalize its error, if any.
///
/// ```ignore
/// let block = fetch_boundary("BlockResolver::latest", async {
///     let conn = pool.borrow().await?;
///     let n = conn.block_number().await;
///     pool.release(conn).await;
///     Ok::<_, PoolError>(n)
/// })
/// .await?;
/// ```
pub async fn fetch_boundary<T, E, Fut>(signature: &str, call: Fut) -> Result<T, DataFetchingError>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
{
    call.await.map_err(|e| translate_error(signature, &e))
}
