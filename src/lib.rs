//! mimo-update library
//!
//! Transactional installer for MIMO storage appliances. The `engine` module
//! runs ordered, reversible actions with rollback on the first failure; the
//! `registrars` build those actions for each subsystem; `updater` drives a
//! complete run.

pub mod bundle;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod paths;
pub mod registrars;
pub mod sanity;
pub mod spdk;
pub mod updater;
pub mod version;

// Re-export main types for convenience
pub use config::{BundleConfig, FileMapping, InitConfig, InitFile};
pub use engine::{Action, Reversible, RollbackError, Transaction, TransactionError, TxState};
pub use error::UpdaterError;
pub use exec::{CommandOutput, CommandRunner, RecordingRunner, SharedRunner, SystemRunner};
pub use paths::SystemPaths;
pub use updater::{UpdateContext, UpdateOutcome};
