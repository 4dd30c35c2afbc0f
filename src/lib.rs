//! # Cistern
//!
//! Pooled database connections with a lightweight one-phase transaction
//! coordinator.
//!
//! A [`DataSource`] hands out connections from a bounded pool: the most
//! recently released connection is reused first, cold connections age
//! out on a time-based sweep, and borrowers wait on a condition variable
//! up to the borrow timeout. When the calling thread is inside a
//! transaction, the borrowed connection is pinned to that transaction
//! (every further borrow on the thread returns the same connection) and
//! commit or rollback flows through a one-phase resource handshake that
//! returns the connection to the pool.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cistern::testing::MemoryDriver;
//! use cistern::{DataSource, PoolConfig, PoolError, TransactionCoordinator};
//!
//! fn main() -> Result<(), PoolError> {
//!     let driver = MemoryDriver::new();
//!     let config = PoolConfig::new("memory:orders").with_pool_size(4);
//!     let ds = DataSource::new("orders", config, Arc::new(driver))?;
//!
//!     // Plain borrow: dropping the handle returns the connection.
//!     let conn = ds.get_connection()?;
//!     conn.execute("CREATE TABLE orders(id INT)")?;
//!     drop(conn);
//!
//!     // Transactional: the same connection is pinned until completion.
//!     TransactionCoordinator::begin()?;
//!     ds.get_connection()?.execute("INSERT INTO orders VALUES (1)")?;
//!     ds.get_connection()?.execute("INSERT INTO orders VALUES (2)")?;
//!     TransactionCoordinator::commit()?;
//!
//!     ds.close();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `cistern-core` | Branch identifiers, the resource contract, the driver contract |
//! | `cistern-txn`  | Transaction state machine and thread-local coordinator |
//! | `cistern-pool` | Bounded pool, pooled connection façade, resource adapter |
//!
//! This crate re-exports the public surface of all three.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use cistern_core::{
    BranchId, BranchStatus, ConnectProps, Driver, DriverError, EndFlag, PrepareVote,
    RawConnection, StartFlag, XaError, XaResource, FORMAT_TAG,
};
pub use cistern_pool::{
    testing, ConfigError, DataSource, PoolConfig, PoolError, PoolStats, PooledConnection,
};
pub use cistern_txn::{
    Synchronization, Transaction, TransactionCoordinator, TxError, TxStatus,
    DEFAULT_TIMEOUT_SECS,
};
