//! Two-phase-commit resource contract
//!
//! [`XaResource`] is the contract a transactional resource exposes to the
//! coordinator. The coordinator in this workspace drives resources with a
//! one-phase commit (`commit(xid, one_phase = true)`); `prepare` exists
//! for completeness of the contract and outer monitors.

use crate::error::XaError;
use crate::xid::BranchId;

/// Flag passed to [`XaResource::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// A new branch is being created for this resource.
    NewBranch,
    /// The resource joins an existing branch.
    Join,
}

/// Flag passed to [`XaResource::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    /// The branch completed its work successfully.
    Success,
    /// The branch failed and will be rolled back.
    Fail,
    /// The branch is suspended and may be resumed later.
    Suspend,
}

/// Vote returned by [`XaResource::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The branch performed no writes; no second phase is needed.
    ReadOnly,
    /// The branch is prepared and awaits commit or rollback.
    Prepared,
}

/// A resource that participates in coordinated commit/rollback.
///
/// Implementations must be callable from the thread that owns the
/// enclosing transaction at completion time, which may differ from the
/// enlisting thread after a suspend/resume handoff.
pub trait XaResource: Send + Sync {
    /// Associate the resource with a branch.
    fn start(&self, xid: &BranchId, flag: StartFlag) -> Result<(), XaError>;

    /// Dissociate the resource from a branch.
    fn end(&self, xid: &BranchId, flag: EndFlag) -> Result<(), XaError>;

    /// First phase of two-phase commit. Unused by the one-phase protocol.
    fn prepare(&self, xid: &BranchId) -> Result<PrepareVote, XaError>;

    /// Commit the branch. `one_phase` is true when no prepare preceded.
    fn commit(&self, xid: &BranchId, one_phase: bool) -> Result<(), XaError>;

    /// Roll back the branch.
    fn rollback(&self, xid: &BranchId) -> Result<(), XaError>;

    /// Discard knowledge of a heuristically completed branch.
    fn forget(&self, xid: &BranchId) -> Result<(), XaError>;

    /// Stable token identifying the underlying resource manager.
    ///
    /// Two adapters over the same physical connection must return the
    /// same token.
    fn rm_identity(&self) -> usize;

    /// Whether both resources front the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.rm_identity() == other.rm_identity()
    }
}
