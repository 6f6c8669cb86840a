//! chainpool-core — pooled connections to blockchain nodes.
//!
//! # Overview
//!
//! Opening a session with a chain node is slow, so callers borrow a
//! long-lived handle from a bounded pool, use it, and give it back. The
//! core crate defines:
//!
//! - [`ChainConnection`] / [`ConnectionFactory`] — capabilities the pool is generic over
//! - [`ConnectionPool`] — bounded pool with validation, eviction and shutdown
//! - [`PoolConfig`] / [`PoolSettings`] — typed and serializable configuration
//! - [`PoolError`] / [`ConnectionError`] — structured error types
//! - [`boundary`] module — normalization of resolver errors into [`DataFetchingError`]
//! - [`ContractResponse`] — response returned by contract calls

pub mod boundary;
pub mod config;
pub mod connection;
mod entry;
pub mod error;
pub mod pool;
pub mod response;

pub use boundary::{fetch_boundary, translate_error, DataFetchingError};
pub use config::{PoolConfig, PoolSettings};
pub use connection::{ChainConnection, ConnectionFactory};
pub use error::{ConnectionError, PoolError};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use response::ContractResponse;
