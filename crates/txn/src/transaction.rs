//! Transaction state machine
//!
//! A [`Transaction`] tracks enlisted resources (one branch per resource,
//! keyed by resource identity) and ordered completion callbacks, and
//! drives them through a one-phase commit or a rollback.
//!
//! The commit protocol is one-phase by design: this coordinator targets
//! the single-resource case (the pooled database connection) and keeps no
//! durable prepare records. With more than one resource enlisted,
//! completion is best-effort in branch-table order: a late resource
//! failing to commit leaves earlier resources committed and the rest
//! rolled back.
//!
//! A transaction is thread-confined. It is mutated only by the thread it
//! is bound to; suspend/resume on the coordinator transfers that
//! ownership. The internal mutex exists so completion callbacks can read
//! transaction state while completion is in progress, not to support
//! concurrent mutation.

use cistern_core::{BranchId, BranchStatus, EndFlag, StartFlag, XaError, XaResource};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::TxError;

static GLOBAL_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide global transaction id.
///
/// # Panics
///
/// Panics if the counter reaches `u64::MAX`.
fn next_global_id() -> u64 {
    GLOBAL_ID_GENERATOR
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
        .expect("transaction id overflow: u64::MAX reached")
        + 1
}

/// Lifecycle status of a [`Transaction`].
///
/// `Committed` and `RolledBack` are absorbing: a transaction in either
/// state rejects every mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Accepting work, enlistment and synchronizations.
    Active,
    /// Doomed to roll back; only delist and completion are allowed.
    MarkedRollback,
    /// Commit protocol is running.
    Committing,
    /// Terminal: all active branches committed.
    Committed,
    /// Rollback protocol is running.
    RollingBack,
    /// Terminal: all active branches saw a rollback attempt.
    RolledBack,
    /// No transaction is associated (coordinator-level status only).
    NoTransaction,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Active => "Active",
            TxStatus::MarkedRollback => "MarkedRollback",
            TxStatus::Committing => "Committing",
            TxStatus::Committed => "Committed",
            TxStatus::RollingBack => "RollingBack",
            TxStatus::RolledBack => "RolledBack",
            TxStatus::NoTransaction => "NoTransaction",
        };
        f.write_str(s)
    }
}

/// Completion callbacks, fired in registration order.
pub trait Synchronization: Send + Sync {
    /// Called before the commit protocol starts.
    fn before_completion(&self);

    /// Called after completion with the terminal status.
    fn after_completion(&self, status: TxStatus);
}

struct Branch {
    resource: Arc<dyn XaResource>,
    id: BranchId,
    status: BranchStatus,
}

struct TxState {
    status: TxStatus,
    branch_counter: u32,
    branches: Vec<Branch>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// A single global transaction.
///
/// Created through the coordinator's `begin`; completed through `commit`
/// or `rollback`, directly or via the coordinator.
pub struct Transaction {
    global_id: u64,
    started: Instant,
    timeout: Duration,
    state: Mutex<TxState>,
}

fn same_resource(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    // Identity of the object, not the vtable: fat pointers from the same
    // allocation may carry distinct vtable pointers across codegen units.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Transaction {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            global_id: next_global_id(),
            started: Instant::now(),
            timeout,
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                branch_counter: 0,
                branches: Vec::new(),
                synchronizations: Vec::new(),
            }),
        }
    }

    /// Global id of this transaction, unique for the process lifetime.
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TxStatus {
        self.state.lock().status
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the transaction has outlived its timeout.
    pub fn is_timed_out(&self) -> bool {
        self.started.elapsed() > self.timeout
    }

    /// Enlist a resource, allocating a fresh branch for it.
    ///
    /// Returns `Ok(false)` without side effects when the resource is
    /// already enlisted. On success the resource has seen
    /// `start(xid, NewBranch)` and is recorded in the branch table.
    ///
    /// # Errors
    ///
    /// [`TxError::TimedOut`] past the timeout, [`TxError::MarkedRollback`]
    /// when doomed, [`TxError::IllegalState`] in any other non-active
    /// state, [`TxError::System`] when the resource rejects `start` (the
    /// branch counter increment is retained: branch numbers need only be
    /// unique within the transaction, not contiguous).
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<bool, TxError> {
        debug!(tx = %self, "enlist");

        let id = {
            let mut state = self.state.lock();
            match state.status {
                TxStatus::Active => {
                    if self.is_timed_out() {
                        return Err(TxError::TimedOut);
                    }
                    if state.branches.iter().any(|b| same_resource(&b.resource, &resource)) {
                        return Ok(false);
                    }
                    state.branch_counter += 1;
                    BranchId::new(self.global_id, state.branch_counter)
                }
                TxStatus::MarkedRollback => return Err(TxError::MarkedRollback),
                _ => return Err(TxError::IllegalState("transaction is not active")),
            }
        };

        resource.start(&id, StartFlag::NewBranch)?;
        self.state.lock().branches.push(Branch {
            resource,
            id,
            status: BranchStatus::Active,
        });
        Ok(true)
    }

    /// Delist a resource, ending its branch with the given flag.
    ///
    /// Returns whether a branch was actually removed.
    ///
    /// # Errors
    ///
    /// [`TxError::IllegalState`] unless the transaction is active or
    /// marked rollback-only.
    pub fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flag: EndFlag,
    ) -> Result<bool, TxError> {
        debug!(tx = %self, "delist");

        let removed = {
            let mut state = self.state.lock();
            match state.status {
                TxStatus::Active | TxStatus::MarkedRollback => {
                    let found = state
                        .branches
                        .iter()
                        .position(|b| same_resource(&b.resource, resource));
                    found.map(|i| state.branches.remove(i))
                }
                _ => return Err(TxError::IllegalState("transaction is not active")),
            }
        };

        match removed {
            Some(branch) => {
                self.release_resource(&*branch.resource, &branch.id, flag);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Register a completion callback.
    ///
    /// # Errors
    ///
    /// [`TxError::MarkedRollback`] when doomed, [`TxError::IllegalState`]
    /// in any other non-active state.
    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<(), TxError> {
        let mut state = self.state.lock();
        match state.status {
            TxStatus::Active => {
                state.synchronizations.push(sync);
                Ok(())
            }
            TxStatus::MarkedRollback => Err(TxError::MarkedRollback),
            _ => Err(TxError::IllegalState("transaction is not active")),
        }
    }

    /// Doom the transaction: the only way out is rollback.
    ///
    /// Idempotent when already marked.
    ///
    /// # Errors
    ///
    /// [`TxError::IllegalState`] once completion has started.
    pub fn set_rollback_only(&self) -> Result<(), TxError> {
        let mut state = self.state.lock();
        match state.status {
            TxStatus::Active | TxStatus::MarkedRollback => {
                state.status = TxStatus::MarkedRollback;
                Ok(())
            }
            _ => Err(TxError::IllegalState("transaction is not active")),
        }
    }

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// On a timed-out or rollback-marked transaction, rollback is
    /// executed first and [`TxError::TimedOut`] or
    /// [`TxError::MarkedRollback`] is raised. A resource failing to
    /// commit triggers rollback of the remaining active branches and
    /// surfaces as [`TxError::System`]. Any other state is
    /// [`TxError::IllegalState`].
    pub fn commit(&self) -> Result<(), TxError> {
        match self.status() {
            TxStatus::Active => {
                if self.is_timed_out() {
                    self.do_rollback()?;
                    return Err(TxError::TimedOut);
                }
                self.do_commit()
            }
            TxStatus::MarkedRollback => {
                self.do_rollback()?;
                Err(TxError::MarkedRollback)
            }
            _ => Err(TxError::IllegalState("transaction is not active")),
        }
    }

    /// Roll back the transaction.
    ///
    /// Idempotent once rolled back.
    ///
    /// # Errors
    ///
    /// [`TxError::IllegalState`] after a successful commit;
    /// [`TxError::System`] when a resource fails to roll back (the
    /// remaining branches are still ended and the transaction still
    /// reaches `RolledBack`).
    pub fn rollback(&self) -> Result<(), TxError> {
        if self.status() == TxStatus::Committed {
            return Err(TxError::IllegalState("transaction is already committed"));
        }
        self.do_rollback()
    }

    fn do_commit(&self) -> Result<(), TxError> {
        debug!(tx = %self, "commit");

        for sync in self.synchronizations() {
            sync.before_completion();
        }
        self.set_status(TxStatus::Committing);

        match self.commit_branches() {
            Ok(()) => {
                self.set_status(TxStatus::Committed);
                self.notify_after_completion(TxStatus::Committed);
                Ok(())
            }
            Err(e) => {
                // The commit failure is what the caller sees; the rollback
                // of the remaining branches reports its own problems only
                // in the log.
                if let Err(rb) = self.do_rollback() {
                    warn!(tx = %self, error = %rb, "rollback after failed commit also failed");
                }
                Err(TxError::System(e))
            }
        }
    }

    /// Commit every branch still active, in branch-table order.
    ///
    /// A branch that fails stays `Active`, so the rollback that follows
    /// still reaches it.
    fn commit_branches(&self) -> Result<(), XaError> {
        let mut idx = 0;
        loop {
            let next = {
                let state = self.state.lock();
                state
                    .branches
                    .iter()
                    .enumerate()
                    .skip(idx)
                    .find(|(_, b)| b.status == BranchStatus::Active)
                    .map(|(i, b)| (i, b.resource.clone(), b.id))
            };
            let Some((i, resource, id)) = next else {
                return Ok(());
            };

            resource.commit(&id, true)?;
            self.release_resource(&*resource, &id, EndFlag::Success);
            self.state.lock().branches[i].status = BranchStatus::Committed;
            idx = i + 1;
        }
    }

    fn do_rollback(&self) -> Result<(), TxError> {
        {
            let mut state = self.state.lock();
            if state.status == TxStatus::RolledBack {
                return Ok(());
            }
            state.status = TxStatus::RollingBack;
        }
        debug!(tx = %self, "rollback");

        let mut first_error: Option<XaError> = None;
        let mut idx = 0;
        loop {
            let next = {
                let state = self.state.lock();
                state
                    .branches
                    .iter()
                    .enumerate()
                    .skip(idx)
                    .find(|(_, b)| b.status == BranchStatus::Active)
                    .map(|(i, b)| (i, b.resource.clone(), b.id))
            };
            let Some((i, resource, id)) = next else {
                break;
            };

            if let Err(e) = resource.rollback(&id) {
                first_error.get_or_insert(e);
            }
            self.release_resource(&*resource, &id, EndFlag::Fail);
            self.state.lock().branches[i].status = BranchStatus::RolledBack;
            idx = i + 1;
        }

        self.set_status(TxStatus::RolledBack);
        self.notify_after_completion(TxStatus::RolledBack);

        match first_error {
            Some(e) => Err(TxError::System(e)),
            None => Ok(()),
        }
    }

    /// End a branch, swallowing failures: by this point the terminal
    /// decision is made and `end` is only a courtesy to the resource.
    fn release_resource(&self, resource: &dyn XaResource, id: &BranchId, flag: EndFlag) {
        if let Err(e) = resource.end(id, flag) {
            warn!(tx = %self, branch = %id, error = %e, "cannot release resource");
        }
    }

    fn set_status(&self, status: TxStatus) {
        self.state.lock().status = status;
    }

    fn synchronizations(&self) -> Vec<Arc<dyn Synchronization>> {
        self.state.lock().synchronizations.clone()
    }

    fn notify_after_completion(&self, status: TxStatus) {
        for sync in self.synchronizations() {
            sync.after_completion(status);
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction{{id={},status={}}}",
            self.global_id,
            self.status()
        )
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("global_id", &self.global_id)
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingResource, XaCall};
    use std::thread;

    fn tx() -> Transaction {
        Transaction::new(Duration::from_secs(60))
    }

    fn resource() -> Arc<RecordingResource> {
        Arc::new(RecordingResource::new())
    }

    #[test]
    fn global_ids_are_unique_and_increasing() {
        let a = tx();
        let b = tx();
        assert!(b.global_id() > a.global_id());
    }

    #[test]
    fn enlist_allocates_increasing_branch_numbers() {
        let t = tx();
        let r1 = resource();
        let r2 = resource();
        assert!(t.enlist_resource(r1.clone()).unwrap());
        assert!(t.enlist_resource(r2.clone()).unwrap());

        let b1 = r1.started_branch().unwrap();
        let b2 = r2.started_branch().unwrap();
        assert_eq!(b1.global_id(), t.global_id());
        assert_eq!(b2.global_id(), t.global_id());
        assert!(b2.branch_no() > b1.branch_no());
    }

    #[test]
    fn enlist_same_resource_twice_returns_false() {
        let t = tx();
        let r = resource();
        assert!(t.enlist_resource(r.clone()).unwrap());
        assert!(!t.enlist_resource(r.clone()).unwrap());
        assert_eq!(r.calls().len(), 1); // a single start, no second branch
    }

    #[test]
    fn failed_enlist_retains_branch_counter_gap() {
        let t = tx();
        let failing = resource();
        failing.fail_next_start();
        assert!(matches!(
            t.enlist_resource(failing.clone()),
            Err(TxError::System(_))
        ));

        let r = resource();
        assert!(t.enlist_resource(r.clone()).unwrap());
        // Branch 1 was consumed by the failed enlistment.
        assert_eq!(r.started_branch().unwrap().branch_no(), 2);
    }

    #[test]
    fn enlist_on_marked_transaction_fails() {
        let t = tx();
        t.set_rollback_only().unwrap();
        assert!(matches!(
            t.enlist_resource(resource()),
            Err(TxError::MarkedRollback)
        ));
    }

    #[test]
    fn enlist_on_timed_out_transaction_fails_without_rollback() {
        let t = Transaction::new(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        assert!(matches!(t.enlist_resource(resource()), Err(TxError::TimedOut)));
        assert_eq!(t.status(), TxStatus::Active); // enlist does not complete the tx
    }

    #[test]
    fn commit_drives_one_phase_protocol() {
        let t = tx();
        let r = resource();
        t.enlist_resource(r.clone()).unwrap();
        t.commit().unwrap();

        assert_eq!(t.status(), TxStatus::Committed);
        let calls = r.calls();
        assert!(matches!(calls[0], XaCall::Start(_, StartFlag::NewBranch)));
        assert!(matches!(calls[1], XaCall::Commit(_, true)));
        assert!(matches!(calls[2], XaCall::End(_, EndFlag::Success)));
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn commit_on_marked_transaction_rolls_back_first() {
        let t = tx();
        let r = resource();
        t.enlist_resource(r.clone()).unwrap();
        t.set_rollback_only().unwrap();

        assert!(matches!(t.commit(), Err(TxError::MarkedRollback)));
        assert_eq!(t.status(), TxStatus::RolledBack);
        let calls = r.calls();
        assert!(matches!(calls[1], XaCall::Rollback(_)));
        assert!(matches!(calls[2], XaCall::End(_, EndFlag::Fail)));
    }

    #[test]
    fn commit_on_timed_out_transaction_rolls_back_first() {
        let t = Transaction::new(Duration::from_millis(10));
        let r = resource();
        t.enlist_resource(r.clone()).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(matches!(t.commit(), Err(TxError::TimedOut)));
        assert_eq!(t.status(), TxStatus::RolledBack);
        assert!(r.calls().iter().any(|c| matches!(c, XaCall::Rollback(_))));
    }

    #[test]
    fn commit_failure_rolls_back_remaining_branches() {
        let t = tx();
        let r1 = resource();
        let r2 = resource();
        t.enlist_resource(r1.clone()).unwrap();
        t.enlist_resource(r2.clone()).unwrap();
        r2.fail_next_commit();

        assert!(matches!(t.commit(), Err(TxError::System(_))));
        assert_eq!(t.status(), TxStatus::RolledBack);

        // First branch committed before the failure and is left committed.
        let c1 = r1.calls();
        assert!(matches!(c1[1], XaCall::Commit(_, true)));
        assert!(matches!(c1[2], XaCall::End(_, EndFlag::Success)));
        assert_eq!(c1.len(), 3);

        // Second branch saw the failed commit, then a rollback attempt.
        let c2 = r2.calls();
        assert!(matches!(c2[1], XaCall::Commit(_, true)));
        assert!(matches!(c2[2], XaCall::Rollback(_)));
        assert!(matches!(c2[3], XaCall::End(_, EndFlag::Fail)));
    }

    #[test]
    fn rollback_is_idempotent() {
        let t = tx();
        let r = resource();
        t.enlist_resource(r.clone()).unwrap();
        t.rollback().unwrap();
        t.rollback().unwrap();

        assert_eq!(t.status(), TxStatus::RolledBack);
        // A single rollback/end pair despite the second call.
        let terminal = r
            .calls()
            .iter()
            .filter(|c| matches!(c, XaCall::Rollback(_) | XaCall::End(_, _)))
            .count();
        assert_eq!(terminal, 2);
    }

    #[test]
    fn rollback_after_commit_is_illegal() {
        let t = tx();
        t.commit().unwrap();
        assert!(matches!(t.rollback(), Err(TxError::IllegalState(_))));
    }

    #[test]
    fn commit_on_completed_transaction_is_illegal() {
        let t = tx();
        t.commit().unwrap();
        assert!(matches!(t.commit(), Err(TxError::IllegalState(_))));
    }

    #[test]
    fn rollback_failure_still_ends_every_branch() {
        let t = tx();
        let r1 = resource();
        let r2 = resource();
        t.enlist_resource(r1.clone()).unwrap();
        t.enlist_resource(r2.clone()).unwrap();
        r1.fail_next_rollback();

        assert!(matches!(t.rollback(), Err(TxError::System(_))));
        assert_eq!(t.status(), TxStatus::RolledBack);
        assert!(r1.calls().iter().any(|c| matches!(c, XaCall::End(_, EndFlag::Fail))));
        assert!(r2.calls().iter().any(|c| matches!(c, XaCall::Rollback(_))));
        assert!(r2.calls().iter().any(|c| matches!(c, XaCall::End(_, EndFlag::Fail))));
    }

    #[test]
    fn delist_removes_branch_and_ends_with_flag() {
        let t = tx();
        let r = resource();
        let as_resource: Arc<dyn XaResource> = r.clone();
        t.enlist_resource(r.clone()).unwrap();

        assert!(t.delist_resource(&as_resource, EndFlag::Suspend).unwrap());
        assert!(matches!(r.calls()[1], XaCall::End(_, EndFlag::Suspend)));

        // Second delist finds nothing.
        assert!(!t.delist_resource(&as_resource, EndFlag::Success).unwrap());

        // The delisted resource plays no part in completion.
        t.commit().unwrap();
        assert_eq!(r.calls().len(), 2);
    }

    #[test]
    fn set_rollback_only_is_idempotent_until_completion() {
        let t = tx();
        t.set_rollback_only().unwrap();
        t.set_rollback_only().unwrap();
        assert_eq!(t.status(), TxStatus::MarkedRollback);

        t.rollback().unwrap();
        assert!(matches!(t.set_rollback_only(), Err(TxError::IllegalState(_))));
    }

    #[test]
    fn synchronizations_fire_in_order_around_commit() {
        use parking_lot::Mutex as PlMutex;

        struct Recorder {
            name: &'static str,
            log: Arc<PlMutex<Vec<String>>>,
        }
        impl Synchronization for Recorder {
            fn before_completion(&self) {
                self.log.lock().push(format!("before:{}", self.name));
            }
            fn after_completion(&self, status: TxStatus) {
                self.log.lock().push(format!("after:{}:{}", self.name, status));
            }
        }

        let log = Arc::new(PlMutex::new(Vec::new()));
        let t = tx();
        t.register_synchronization(Arc::new(Recorder { name: "a", log: log.clone() }))
            .unwrap();
        t.register_synchronization(Arc::new(Recorder { name: "b", log: log.clone() }))
            .unwrap();
        t.commit().unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "before:a".to_string(),
                "before:b".to_string(),
                "after:a:Committed".to_string(),
                "after:b:Committed".to_string(),
            ]
        );
    }

    #[test]
    fn synchronizations_see_rolled_back_status() {
        struct Observer {
            seen: Arc<parking_lot::Mutex<Option<TxStatus>>>,
        }
        impl Synchronization for Observer {
            fn before_completion(&self) {}
            fn after_completion(&self, status: TxStatus) {
                *self.seen.lock() = Some(status);
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let t = tx();
        t.register_synchronization(Arc::new(Observer { seen: seen.clone() }))
            .unwrap();
        t.rollback().unwrap();
        assert_eq!(*seen.lock(), Some(TxStatus::RolledBack));
    }

    #[test]
    fn register_synchronization_on_marked_transaction_fails() {
        let t = tx();
        t.set_rollback_only().unwrap();

        struct Nop;
        impl Synchronization for Nop {
            fn before_completion(&self) {}
            fn after_completion(&self, _: TxStatus) {}
        }
        assert!(matches!(
            t.register_synchronization(Arc::new(Nop)),
            Err(TxError::MarkedRollback)
        ));
    }
}
