//! Resource adapter
//!
//! [`ConnectionResource`] adapts a pooled connection to the
//! two-phase-commit resource contract so the transaction coordinator can
//! drive it. `start` and `end` are no-ops: presence in the transaction's
//! branch table is the binding. After a successful commit, or after any
//! rollback outcome, the adapter unpins the connection through the pool,
//! which restores auto-commit and returns it to the idle set.

use cistern_core::{BranchId, EndFlag, PrepareVote, StartFlag, XaError, XaResource};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::connection::ConnectionInner;
use crate::datasource::PoolShared;

pub(crate) struct ConnectionResource {
    inner: Arc<ConnectionInner>,
    pool: Weak<PoolShared>,
}

impl ConnectionResource {
    pub(crate) fn new(inner: Arc<ConnectionInner>, pool: Weak<PoolShared>) -> Self {
        Self { inner, pool }
    }

    fn unpin_and_release(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister_from_transaction(&self.inner);
        } else {
            // The pool is gone; nobody will reuse this connection.
            self.inner.destroy();
        }
    }
}

impl XaResource for ConnectionResource {
    fn start(&self, xid: &BranchId, _flag: StartFlag) -> Result<(), XaError> {
        debug!(branch = %xid, "start");
        Ok(())
    }

    fn end(&self, xid: &BranchId, _flag: EndFlag) -> Result<(), XaError> {
        debug!(branch = %xid, "end");
        Ok(())
    }

    fn prepare(&self, _xid: &BranchId) -> Result<PrepareVote, XaError> {
        // No durable prepare records are kept; the coordinator commits
        // one-phase and an outer monitor gets the read-only vote.
        Ok(PrepareVote::ReadOnly)
    }

    fn commit(&self, xid: &BranchId, _one_phase: bool) -> Result<(), XaError> {
        debug!(branch = %xid, "commit");
        self.inner
            .with_raw(|raw| raw.commit())
            .map_err(|e| XaError::Driver {
                op: "commit",
                source: e,
            })?;
        self.unpin_and_release();
        Ok(())
    }

    fn rollback(&self, xid: &BranchId) -> Result<(), XaError> {
        debug!(branch = %xid, "rollback");
        let result = self.inner.with_raw(|raw| raw.rollback());
        // Whatever the raw rollback did, the transaction is over for
        // this connection; unpin so it is released (a fatal failure has
        // set the invalidate flag and the release destroys it).
        self.unpin_and_release();
        result.map_err(|e| XaError::Driver {
            op: "rollback",
            source: e,
        })
    }

    fn forget(&self, _xid: &BranchId) -> Result<(), XaError> {
        Ok(())
    }

    fn rm_identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}
