//! Test doubles for the resource contract
//!
//! [`RecordingResource`] is an in-memory [`XaResource`] that records every
//! call it receives and can be told to fail its next start, commit or
//! rollback. It backs the unit tests here and the end-to-end scenarios at
//! the workspace root.

use cistern_core::{BranchId, EndFlag, PrepareVote, StartFlag, XaError, XaResource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One observed call on a [`RecordingResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaCall {
    /// `start(xid, flag)`
    Start(BranchId, StartFlag),
    /// `end(xid, flag)`
    End(BranchId, EndFlag),
    /// `prepare(xid)`
    Prepare(BranchId),
    /// `commit(xid, one_phase)`
    Commit(BranchId, bool),
    /// `rollback(xid)`
    Rollback(BranchId),
    /// `forget(xid)`
    Forget(BranchId),
}

/// An [`XaResource`] that records calls and fails on demand.
#[derive(Default)]
pub struct RecordingResource {
    calls: Mutex<Vec<XaCall>>,
    fail_start: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl RecordingResource {
    /// A resource that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` fail.
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Make the next `commit` fail.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next `rollback` fail.
    pub fn fail_next_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<XaCall> {
        self.calls.lock().clone()
    }

    /// The branch id passed to the first successful `start`, if any.
    pub fn started_branch(&self) -> Option<BranchId> {
        self.calls.lock().iter().find_map(|c| match c {
            XaCall::Start(id, _) => Some(*id),
            _ => None,
        })
    }

    fn record(&self, call: XaCall) {
        self.calls.lock().push(call);
    }

    fn trip(&self, flag: &AtomicBool, op: &str) -> Result<(), XaError> {
        if flag.swap(false, Ordering::SeqCst) {
            Err(XaError::Protocol(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

impl XaResource for RecordingResource {
    fn start(&self, xid: &BranchId, flag: StartFlag) -> Result<(), XaError> {
        self.trip(&self.fail_start, "start")?;
        self.record(XaCall::Start(*xid, flag));
        Ok(())
    }

    fn end(&self, xid: &BranchId, flag: EndFlag) -> Result<(), XaError> {
        self.record(XaCall::End(*xid, flag));
        Ok(())
    }

    fn prepare(&self, xid: &BranchId) -> Result<PrepareVote, XaError> {
        self.record(XaCall::Prepare(*xid));
        Ok(PrepareVote::Prepared)
    }

    fn commit(&self, xid: &BranchId, one_phase: bool) -> Result<(), XaError> {
        self.record(XaCall::Commit(*xid, one_phase));
        self.trip(&self.fail_commit, "commit")
    }

    fn rollback(&self, xid: &BranchId) -> Result<(), XaError> {
        self.record(XaCall::Rollback(*xid));
        self.trip(&self.fail_rollback, "rollback")
    }

    fn forget(&self, xid: &BranchId) -> Result<(), XaError> {
        self.record(XaCall::Forget(*xid));
        Ok(())
    }

    fn rm_identity(&self) -> usize {
        self as *const Self as usize
    }
}
