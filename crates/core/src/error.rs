//! Errors at the driver and resource seams

use thiserror::Error;

/// Failure reported by a database driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The connection URL is not handled by this driver.
    #[error("unsupported connection string: {0}")]
    UnsupportedUrl(String),

    /// Opening a connection failed.
    #[error("cannot open connection: {0}")]
    Connect(String),

    /// The connection is no longer usable.
    #[error("connection is broken: {0}")]
    ConnectionBroken(String),

    /// The connection was already closed.
    #[error("connection is closed")]
    Closed,

    /// A statement was rejected by the database.
    #[error("statement rejected: {0}")]
    Rejected(String),
}

impl DriverError {
    /// Whether the connection that raised this error must not be reused.
    ///
    /// A fatal error makes the pool set the invalidate flag, so the
    /// connection is destroyed instead of returned to the idle set.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::ConnectionBroken(_) | DriverError::Closed)
    }
}

/// Failure raised by an [`XaResource`](crate::resource::XaResource).
#[derive(Debug, Error)]
pub enum XaError {
    /// The underlying driver failed during a resource operation.
    #[error("resource failed during {op}: {source}")]
    Driver {
        /// Resource operation that failed (`commit`, `rollback`, ...).
        op: &'static str,
        /// The driver failure.
        #[source]
        source: DriverError,
    },

    /// The resource refused the operation at the protocol level.
    #[error("{0}")]
    Protocol(String),
}
