//! Branch identifiers
//!
//! A [`BranchId`] names one resource's participation (a *branch*) in a
//! global transaction. Identity is the pair `(global_id, branch_no)`;
//! the global id is process-unique, the branch number is allocated by the
//! owning transaction and is unique within it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Format tag carried in the serialized form of every [`BranchId`].
pub const FORMAT_TAG: u32 = 0x4F64_6B6C;

/// Identity of one branch of a global transaction.
///
/// The serialized form is the fixed [`FORMAT_TAG`] plus the big-endian
/// bytes of the two numeric fields, exposed separately so an outer
/// monitor can reassemble the full identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId {
    global_id: u64,
    branch_no: u32,
}

impl BranchId {
    /// Create a branch identifier.
    pub fn new(global_id: u64, branch_no: u32) -> Self {
        Self {
            global_id,
            branch_no,
        }
    }

    /// Global transaction id this branch belongs to.
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Branch number within the transaction.
    pub fn branch_no(&self) -> u32 {
        self.branch_no
    }

    /// Format tag of the serialized form.
    pub fn format_tag(&self) -> u32 {
        FORMAT_TAG
    }

    /// Big-endian bytes of the global transaction id.
    pub fn global_id_bytes(&self) -> [u8; 8] {
        self.global_id.to_be_bytes()
    }

    /// Big-endian bytes of the branch number.
    pub fn branch_bytes(&self) -> [u8; 4] {
        self.branch_no.to_be_bytes()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.global_id, self.branch_no)
    }
}

/// Completion status of a single branch.
///
/// Not part of the branch's identity. Transitions exactly once, from
/// `Active` to either terminal state, driven by the owning transaction's
/// completion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    /// Branch is enlisted and has seen no terminal call.
    Active,
    /// Branch saw a successful one-phase commit.
    Committed,
    /// Branch saw a rollback attempt.
    RolledBack,
}
