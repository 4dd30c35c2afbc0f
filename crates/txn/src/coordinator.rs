//! Thread-local transaction coordination
//!
//! [`TransactionCoordinator`] is a process-wide facility with two
//! per-thread slots: the transaction bound to the current thread and an
//! optional timeout override for the next `begin`. There is no instance
//! to construct; the slots live in thread-local storage and the
//! coordinator is reached through associated functions.
//!
//! The binding is cleared on every exit path of [`commit`] and
//! [`rollback`], success or failure, so a thread can never observe a
//! completed transaction as current.
//!
//! [`commit`]: TransactionCoordinator::commit
//! [`rollback`]: TransactionCoordinator::rollback

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::TxError;
use crate::transaction::{Transaction, TxStatus};

/// Timeout applied when no per-thread override is set.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Transaction>>> = RefCell::new(None);
    static TIMEOUT_OVERRIDE: Cell<Option<u64>> = Cell::new(None);
}

/// Process-wide transaction coordinator with thread-local association.
pub struct TransactionCoordinator;

impl TransactionCoordinator {
    /// Begin a transaction and bind it to the current thread.
    ///
    /// The timeout is the per-thread override when one is set, otherwise
    /// [`DEFAULT_TIMEOUT_SECS`].
    ///
    /// # Errors
    ///
    /// [`TxError::NestedUnsupported`] when a transaction is already
    /// bound to this thread.
    pub fn begin() -> Result<Arc<Transaction>, TxError> {
        if Self::current().is_some() {
            return Err(TxError::NestedUnsupported);
        }
        let secs = TIMEOUT_OVERRIDE.with(Cell::get).unwrap_or(DEFAULT_TIMEOUT_SECS);
        let tx = Arc::new(Transaction::new(Duration::from_secs(secs)));
        debug!(tx = %tx, "begin");
        CURRENT.with(|slot| *slot.borrow_mut() = Some(tx.clone()));
        Ok(tx)
    }

    /// Transaction bound to the current thread, if any.
    pub fn current() -> Option<Arc<Transaction>> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Status of the current thread's transaction;
    /// [`TxStatus::NoTransaction`] when unbound.
    pub fn status() -> TxStatus {
        Self::current().map_or(TxStatus::NoTransaction, |tx| tx.status())
    }

    /// Commit the current thread's transaction.
    ///
    /// The binding is cleared whether the commit succeeds or fails.
    ///
    /// # Errors
    ///
    /// [`TxError::NoTransaction`] when unbound; otherwise whatever
    /// [`Transaction::commit`] reports.
    pub fn commit() -> Result<(), TxError> {
        let tx = Self::current().ok_or(TxError::NoTransaction)?;
        let result = tx.commit();
        Self::clear();
        result
    }

    /// Roll back the current thread's transaction.
    ///
    /// The binding is cleared whether the rollback succeeds or fails.
    ///
    /// # Errors
    ///
    /// [`TxError::NoTransaction`] when unbound; otherwise whatever
    /// [`Transaction::rollback`] reports.
    pub fn rollback() -> Result<(), TxError> {
        let tx = Self::current().ok_or(TxError::NoTransaction)?;
        let result = tx.rollback();
        Self::clear();
        result
    }

    /// Mark the current thread's transaction rollback-only.
    ///
    /// # Errors
    ///
    /// [`TxError::NoTransaction`] when unbound.
    pub fn set_rollback_only() -> Result<(), TxError> {
        Self::current()
            .ok_or(TxError::NoTransaction)?
            .set_rollback_only()
    }

    /// Set the timeout for transactions subsequently begun on this
    /// thread. Positive values store the override, zero clears it.
    ///
    /// # Errors
    ///
    /// [`TxError::NegativeTimeout`] for negative values.
    pub fn set_transaction_timeout(seconds: i64) -> Result<(), TxError> {
        match seconds {
            s if s > 0 => {
                TIMEOUT_OVERRIDE.with(|slot| slot.set(Some(s as u64)));
                Ok(())
            }
            0 => {
                TIMEOUT_OVERRIDE.with(|slot| slot.set(None));
                Ok(())
            }
            _ => Err(TxError::NegativeTimeout),
        }
    }

    /// Unbind and return the current thread's transaction.
    ///
    /// A timed-out transaction is returned like any other; the clock is
    /// not reset and the timeout will be observed at the next mutating
    /// operation after a resume.
    pub fn suspend() -> Option<Arc<Transaction>> {
        CURRENT.with(|slot| slot.borrow_mut().take())
    }

    /// Bind a previously suspended transaction to the current thread.
    ///
    /// # Errors
    ///
    /// [`TxError::IllegalState`] when a transaction is already bound.
    pub fn resume(tx: Arc<Transaction>) -> Result<(), TxError> {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(TxError::IllegalState("transaction is already associated"));
            }
            *slot = Some(tx);
            Ok(())
        })
    }

    fn clear() {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // Each #[test] runs on its own thread, so the thread-local slots
    // start empty and tests do not interfere.

    #[test]
    fn begin_binds_and_commit_clears() {
        let tx = TransactionCoordinator::begin().unwrap();
        assert_eq!(
            TransactionCoordinator::current().unwrap().global_id(),
            tx.global_id()
        );
        TransactionCoordinator::commit().unwrap();
        assert!(TransactionCoordinator::current().is_none());
        assert_eq!(TransactionCoordinator::status(), TxStatus::NoTransaction);
    }

    #[test]
    fn nested_begin_is_rejected() {
        TransactionCoordinator::begin().unwrap();
        assert!(matches!(
            TransactionCoordinator::begin(),
            Err(TxError::NestedUnsupported)
        ));
        TransactionCoordinator::rollback().unwrap();
    }

    #[test]
    fn commit_without_transaction_fails() {
        assert!(matches!(
            TransactionCoordinator::commit(),
            Err(TxError::NoTransaction)
        ));
    }

    #[test]
    fn binding_is_cleared_even_when_commit_fails() {
        let tx = TransactionCoordinator::begin().unwrap();
        tx.set_rollback_only().unwrap();
        assert!(matches!(
            TransactionCoordinator::commit(),
            Err(TxError::MarkedRollback)
        ));
        assert!(TransactionCoordinator::current().is_none());
    }

    #[test]
    fn default_timeout_applies_without_override() {
        let tx = TransactionCoordinator::begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        TransactionCoordinator::rollback().unwrap();
    }

    #[test]
    fn timeout_override_applies_and_clears() {
        TransactionCoordinator::set_transaction_timeout(5).unwrap();
        let tx = TransactionCoordinator::begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(5));
        TransactionCoordinator::rollback().unwrap();

        TransactionCoordinator::set_transaction_timeout(0).unwrap();
        let tx = TransactionCoordinator::begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        TransactionCoordinator::rollback().unwrap();
    }

    #[test]
    fn negative_timeout_is_rejected() {
        assert!(matches!(
            TransactionCoordinator::set_transaction_timeout(-1),
            Err(TxError::NegativeTimeout)
        ));
    }

    #[test]
    fn suspend_clears_and_resume_rebinds() {
        let tx = TransactionCoordinator::begin().unwrap();
        let suspended = TransactionCoordinator::suspend().unwrap();
        assert!(TransactionCoordinator::current().is_none());
        assert_eq!(suspended.global_id(), tx.global_id());

        TransactionCoordinator::resume(suspended).unwrap();
        assert_eq!(
            TransactionCoordinator::current().unwrap().global_id(),
            tx.global_id()
        );
        TransactionCoordinator::rollback().unwrap();
    }

    #[test]
    fn resume_over_existing_binding_fails() {
        let first = TransactionCoordinator::begin().unwrap();
        let foreign = TransactionCoordinator::suspend().unwrap();
        TransactionCoordinator::begin().unwrap();

        assert!(matches!(
            TransactionCoordinator::resume(foreign.clone()),
            Err(TxError::IllegalState(_))
        ));

        TransactionCoordinator::rollback().unwrap();
        drop(first);
        foreign.rollback().unwrap();
    }

    #[test]
    fn suspend_without_transaction_returns_none() {
        assert!(TransactionCoordinator::suspend().is_none());
    }

    #[test]
    fn bindings_are_per_thread() {
        TransactionCoordinator::begin().unwrap();

        let handle = thread::spawn(|| {
            assert!(TransactionCoordinator::current().is_none());
            TransactionCoordinator::begin().unwrap();
            TransactionCoordinator::commit().unwrap();
        });
        handle.join().unwrap();

        assert!(TransactionCoordinator::current().is_some());
        TransactionCoordinator::rollback().unwrap();
    }

    #[test]
    fn suspended_transaction_moves_between_threads() {
        TransactionCoordinator::begin().unwrap();
        let suspended = TransactionCoordinator::suspend().unwrap();

        let handle = thread::spawn(move || {
            TransactionCoordinator::resume(suspended).unwrap();
            TransactionCoordinator::commit().unwrap();
        });
        handle.join().unwrap();

        assert!(TransactionCoordinator::current().is_none());
    }
}
