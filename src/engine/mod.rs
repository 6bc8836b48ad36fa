//! Engine modules: the reversible-change core of the updater.
//!
//! The engine knows nothing about files, bootloaders or services. It runs an
//! ordered list of actions and compensates for the applied prefix when one
//! of them fails. Registrars build the actions; the updater drives the run.

pub mod action;
pub mod transaction;

pub use action::{Action, Reversible};
pub use transaction::{
    ActionFailure, RollbackError, Transaction, TransactionError, TxState, UndoFailure,
};
