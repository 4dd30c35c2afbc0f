//! Transaction layer for cistern
//!
//! This crate implements the one-phase transaction coordination:
//! - Transaction: lifecycle state machine with resource enlistment and
//!   ordered completion callbacks
//! - TransactionCoordinator: process-wide thread-local association with
//!   begin/suspend/resume and delegated completion
//!
//! There is no durable log: commit is one-phase and best-effort across
//! multiple resources. The intended shape is one pooled database
//! connection per transaction, enlisted by the pool crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod error;
pub mod testing;
pub mod transaction;

pub use coordinator::{TransactionCoordinator, DEFAULT_TIMEOUT_SECS};
pub use error::TxError;
pub use transaction::{Synchronization, Transaction, TxStatus};
