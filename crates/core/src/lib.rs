//! Core types and contracts for cistern
//!
//! This crate defines the leaf vocabulary shared by the transaction
//! coordinator and the connection pool:
//! - BranchId: identity of one resource's participation in a transaction
//! - XaResource: the two-phase-commit resource contract
//! - Driver / RawConnection: the database driver boundary
//! - DriverError / XaError: failures at those two seams
//!
//! Nothing in here performs I/O; the traits are object-safe seams that the
//! pool crate implements and the transaction crate consumes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod error;
pub mod resource;
pub mod xid;

pub use driver::{ConnectProps, Driver, RawConnection};
pub use error::{DriverError, XaError};
pub use resource::{EndFlag, PrepareVote, StartFlag, XaResource};
pub use xid::{BranchId, BranchStatus, FORMAT_TAG};
