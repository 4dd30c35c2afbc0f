//! Connection pool for cistern
//!
//! This crate implements the pooled datasource:
//! - DataSource: bounded pool with LIFO reuse, borrow-wait with timeout,
//!   time-based idle eviction and graceful shutdown
//! - PooledConnection: borrower façade whose close returns to the pool
//! - transaction affinity: inside a transaction, one pooled connection
//!   is pinned until completion, enlisted as a one-phase resource
//!
//! The [`testing`] module ships an in-memory driver used by the tests
//! and examples.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod datasource;
pub mod error;
mod resource;
pub mod testing;

pub use config::{ConfigError, PoolConfig};
pub use connection::PooledConnection;
pub use datasource::{DataSource, PoolStats};
pub use error::PoolError;
