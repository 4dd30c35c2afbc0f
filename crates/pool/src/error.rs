//! Pool errors

use cistern_core::DriverError;
use cistern_txn::TxError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure raised by the datasource or a pooled connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The datasource has been shut down.
    #[error("datasource is closed")]
    Closed,

    /// No connection became free within the borrow timeout.
    #[error("datasource timed out waiting for a free connection")]
    BorrowTimeout,

    /// The borrower was interrupted while blocked: a peer thread
    /// panicked inside a pool critical section during the wait. Only
    /// the blocked borrower observes this; the pool itself recovers.
    #[error("interrupted while waiting for a free connection")]
    Interrupted,

    /// Auto-commit cannot change while the connection is enlisted in a
    /// transaction.
    #[error("cannot change auto-commit while enlisted in a transaction")]
    AutoCommitLocked,

    /// The underlying driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The datasource descriptor is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transaction enlistment or lookup failed.
    #[error(transparent)]
    Transaction(#[from] TxError),
}
