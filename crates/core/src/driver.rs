//! Database driver contract
//!
//! The pool opens raw connections through [`Driver::connect`] and never
//! sees a concrete driver type. A driver is given the connection URL and
//! a credential bag and either produces a [`RawConnection`] or fails with
//! a [`DriverError`].

use crate::error::DriverError;

/// Credentials handed to [`Driver::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectProps {
    /// User name, if configured.
    pub user: Option<String>,
    /// Password, if configured.
    pub password: Option<String>,
}

impl ConnectProps {
    /// Credential bag with both fields set.
    pub fn new(user: Option<String>, password: Option<String>) -> Self {
        Self { user, password }
    }
}

/// Opens raw connections from a URL and credentials.
pub trait Driver: Send + Sync {
    /// Open a new raw connection.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnsupportedUrl`] when the URL does not
    /// belong to this driver, or another [`DriverError`] when the open
    /// itself fails.
    fn connect(
        &self,
        url: &str,
        props: &ConnectProps,
    ) -> Result<Box<dyn RawConnection>, DriverError>;
}

/// A raw database connection, exclusively owned by its holder.
///
/// All methods take `&mut self`: a raw connection is never shared, it is
/// owned by the pool (idle), a borrower, or a transaction, and ownership
/// transfers whole.
pub trait RawConnection: Send {
    /// Execute a statement, returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Execute a query and return the first column of the first row.
    fn query_row(&mut self, sql: &str) -> Result<Option<String>, DriverError>;

    /// Commit the current unit of work.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current unit of work.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Switch auto-commit mode.
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> bool;

    /// Close the connection. Further calls fail with
    /// [`DriverError::Closed`].
    fn close(&mut self) -> Result<(), DriverError>;
}
