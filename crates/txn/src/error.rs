//! Transaction errors

use cistern_core::XaError;
use thiserror::Error;

/// Failure raised by the transaction state machine or the coordinator.
#[derive(Debug, Error)]
pub enum TxError {
    /// Commit or enlistment found the transaction past its timeout.
    /// On commit, rollback has already been executed when this is raised.
    #[error("transaction is timed out")]
    TimedOut,

    /// Commit or enlistment found the transaction marked rollback-only.
    /// On commit, rollback has already been executed when this is raised.
    #[error("transaction is marked for rollback")]
    MarkedRollback,

    /// The operation is not legal in the transaction's current state.
    #[error("{0}")]
    IllegalState(&'static str),

    /// No transaction is associated with the current thread.
    #[error("no associated transaction")]
    NoTransaction,

    /// `begin` was called while a transaction is already associated.
    #[error("nested transactions not allowed")]
    NestedUnsupported,

    /// A negative value was passed as a transaction timeout.
    #[error("negative timeout value")]
    NegativeTimeout,

    /// A resource failed during enlistment or completion.
    #[error("resource failure: {0}")]
    System(#[from] XaError),
}
