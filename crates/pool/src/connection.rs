//! Pooled connection façade
//!
//! [`PooledConnection`] is the handle a borrower works with. It forwards
//! database calls to the raw driver connection and intercepts close:
//! dropping the handle returns the connection to the pool instead of
//! destroying it. While the connection is pinned to a transaction the
//! handle is inert on drop; the transaction's completion releases the
//! connection.
//!
//! The shared state behind a handle lives in [`ConnectionInner`], which
//! the pool keeps in its idle queue and affinity map. A placement state
//! plus a borrow epoch make release idempotent: a stale handle dropped
//! after its connection moved on cannot push the connection into the
//! idle queue a second time.

use cistern_core::{DriverError, RawConnection};
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

use crate::datasource::PoolShared;
use crate::error::PoolError;

const BORROWED: u8 = 0;
const IDLE: u8 = 1;
const DESTROYED: u8 = 2;

pub(crate) struct ConnectionInner {
    raw: Mutex<Option<Box<dyn RawConnection>>>,
    last_access: Mutex<Instant>,
    pinned: Mutex<Option<u64>>,
    invalidate: AtomicBool,
    placement: AtomicU8,
    epoch: AtomicU64,
    pool: Weak<PoolShared>,
}

impl ConnectionInner {
    pub(crate) fn new(raw: Box<dyn RawConnection>, pool: Weak<PoolShared>, now: Instant) -> Self {
        Self {
            raw: Mutex::new(Some(raw)),
            last_access: Mutex::new(now),
            pinned: Mutex::new(None),
            invalidate: AtomicBool::new(false),
            placement: AtomicU8::new(BORROWED),
            epoch: AtomicU64::new(0),
            pool,
        }
    }

    pub(crate) fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Transition idle -> borrowed: stamp the access time and open a new
    /// borrow epoch so handles from the previous borrow become inert.
    pub(crate) fn mark_borrowed(&self, now: Instant) {
        *self.last_access.lock() = now;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.placement.store(BORROWED, Ordering::SeqCst);
    }

    /// Transition borrowed -> idle. False when the connection is not
    /// currently borrowed (a stale or repeated release).
    pub(crate) fn mark_idle(&self) -> bool {
        self.placement
            .compare_exchange(BORROWED, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the right to destroy. False when someone else already did.
    pub(crate) fn begin_destroy(&self) -> bool {
        self.placement.swap(DESTROYED, Ordering::SeqCst) != DESTROYED
    }

    /// Close the raw connection. Must be called without the pool monitor
    /// held; closing is I/O.
    pub(crate) fn close_raw(&self) {
        if let Some(mut raw) = self.raw.lock().take() {
            if let Err(e) = raw.close() {
                debug!(error = %e, "closing raw connection failed");
            }
        }
    }

    pub(crate) fn destroy(&self) {
        if self.begin_destroy() {
            self.close_raw();
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn pin(&self, tx_id: u64) {
        *self.pinned.lock() = Some(tx_id);
    }

    pub(crate) fn unpin(&self) -> Option<u64> {
        self.pinned.lock().take()
    }

    pub(crate) fn pinned(&self) -> Option<u64> {
        *self.pinned.lock()
    }

    pub(crate) fn invalidated(&self) -> bool {
        self.invalidate.load(Ordering::SeqCst)
    }

    pub(crate) fn set_invalidated(&self) {
        self.invalidate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn pool(&self) -> Option<Arc<PoolShared>> {
        self.pool.upgrade()
    }

    /// Run a driver call on the raw connection. A fatal driver error
    /// sets the invalidate flag so the connection is destroyed at
    /// release instead of returned to the idle set.
    pub(crate) fn with_raw<T>(
        &self,
        f: impl FnOnce(&mut dyn RawConnection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut guard = self.raw.lock();
        let raw = guard.as_deref_mut().ok_or(DriverError::Closed)?;
        match f(raw) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_fatal() {
                    debug!(error = %e, "invalidating broken connection");
                    self.set_invalidated();
                }
                Err(e)
            }
        }
    }
}

/// A connection borrowed from a [`DataSource`](crate::DataSource).
///
/// Dropping the handle (or calling [`close`](PooledConnection::close))
/// returns the connection to the pool. While the connection is enlisted
/// in a transaction, the handle is a view only: dropping it does nothing
/// and the transaction's completion decides the connection's fate.
pub struct PooledConnection {
    inner: Arc<ConnectionInner>,
    epoch: u64,
    released: Cell<bool>,
}

impl PooledConnection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        let epoch = inner.epoch();
        Self {
            inner,
            epoch,
            released: Cell::new(false),
        }
    }

    /// Execute a statement, returning the affected row count.
    ///
    /// # Errors
    ///
    /// Driver failures pass through; a fatal one additionally marks the
    /// connection for destruction at release.
    pub fn execute(&self, sql: &str) -> Result<u64, PoolError> {
        self.inner.with_raw(|raw| raw.execute(sql)).map_err(Into::into)
    }

    /// Execute a query and return the first column of the first row.
    pub fn query_row(&self, sql: &str) -> Result<Option<String>, PoolError> {
        self.inner
            .with_raw(|raw| raw.query_row(sql))
            .map_err(Into::into)
    }

    /// Commit the current unit of work on the underlying connection.
    pub fn commit(&self) -> Result<(), PoolError> {
        self.inner.with_raw(|raw| raw.commit()).map_err(Into::into)
    }

    /// Roll back the current unit of work on the underlying connection.
    pub fn rollback(&self) -> Result<(), PoolError> {
        self.inner.with_raw(|raw| raw.rollback()).map_err(Into::into)
    }

    /// Switch auto-commit mode.
    ///
    /// # Errors
    ///
    /// [`PoolError::AutoCommitLocked`] while the connection is enlisted
    /// in a transaction; the transaction owns the commit boundary.
    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<(), PoolError> {
        if self.inner.pinned().is_some() {
            return Err(PoolError::AutoCommitLocked);
        }
        self.inner
            .with_raw(|raw| raw.set_auto_commit(auto_commit))
            .map_err(Into::into)
    }

    /// Current auto-commit mode.
    pub fn auto_commit(&self) -> Result<bool, PoolError> {
        self.inner
            .with_raw(|raw| Ok(raw.auto_commit()))
            .map_err(Into::into)
    }

    /// Whether the connection was marked for destruction at release.
    pub fn invalidated(&self) -> bool {
        self.inner.invalidated()
    }

    /// Return the connection to the pool. Equivalent to dropping the
    /// handle.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pinned", &self.inner.pinned())
            .field("invalidated", &self.inner.invalidated())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released.replace(true) {
            return;
        }
        // Pinned: the transaction owns the connection; its completion
        // releases it through the resource adapter.
        if self.inner.pinned().is_some() {
            return;
        }
        // Stale: the connection was already released and handed to
        // another borrower.
        if self.inner.epoch() != self.epoch {
            return;
        }
        match self.inner.pool() {
            Some(pool) => pool.release(&self.inner),
            None => self.inner.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDriver;
    use cistern_core::{ConnectProps, Driver};

    fn inner(driver: &MemoryDriver) -> Arc<ConnectionInner> {
        let raw = driver
            .connect("memory:test", &ConnectProps::default())
            .unwrap();
        Arc::new(ConnectionInner::new(raw, Weak::new(), Instant::now()))
    }

    #[test]
    fn fatal_error_sets_invalidate() {
        let driver = MemoryDriver::new();
        driver.break_on_statement("KILL");
        let conn = PooledConnection::from_inner(inner(&driver));

        assert!(conn.execute("KILL").is_err());
        assert!(conn.invalidated());
    }

    #[test]
    fn non_fatal_error_keeps_connection_valid() {
        let driver = MemoryDriver::new();
        driver.reject_statement("BAD");
        let conn = PooledConnection::from_inner(inner(&driver));

        assert!(conn.execute("BAD SQL").is_err());
        assert!(!conn.invalidated());
        assert!(conn.execute("GOOD SQL").is_ok());
    }

    #[test]
    fn auto_commit_is_locked_while_pinned() {
        let driver = MemoryDriver::new();
        let inner = inner(&driver);
        inner.pin(7);
        let conn = PooledConnection::from_inner(inner.clone());

        assert!(matches!(
            conn.set_auto_commit(false),
            Err(PoolError::AutoCommitLocked)
        ));

        inner.unpin();
        conn.set_auto_commit(false).unwrap();
        assert!(!conn.auto_commit().unwrap());
    }

    #[test]
    fn drop_without_pool_destroys_raw_connection() {
        let driver = MemoryDriver::new();
        let conn = PooledConnection::from_inner(inner(&driver));
        drop(conn);
        assert_eq!(driver.closed_count(), 1);
    }

    #[test]
    fn drop_while_pinned_leaves_connection_open() {
        let driver = MemoryDriver::new();
        let shared = inner(&driver);
        shared.pin(7);
        drop(PooledConnection::from_inner(shared.clone()));
        assert_eq!(driver.closed_count(), 0);

        shared.destroy();
        assert_eq!(driver.closed_count(), 1);
    }

    #[test]
    fn destroy_is_idempotent() {
        let driver = MemoryDriver::new();
        let shared = inner(&driver);
        shared.destroy();
        shared.destroy();
        assert_eq!(driver.closed_count(), 1);
    }
}
