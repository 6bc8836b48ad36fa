//! Compensating transaction engine
//!
//! A `Transaction` is an ordered, single-use list of `Action`s. `run()`
//! applies them strictly in insertion order; the first failure stops the
//! script and every action that already applied is undone in reverse order.
//!
//! # State Flow
//!
//! ```text
//! Empty ──add──▶ Populated ──run──▶ Running ──▶ Committed
//!                                        │
//!                                        └────▶ RolledBack
//!
//! (cleanup() moves any state to Cleaned; a cleaned transaction rejects add/run)
//! ```
//!
//! # Failure Semantics
//!
//! - Forward failure: stop, roll back, report the failed action and its cause.
//! - Undo failure: recorded, the walk continues, every failed compensation is
//!   reported in a `RollbackError`.
//! - Rollback is attempted once per run. Failed compensations are not retried.

use std::fmt;

use strum::Display;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::action::Action;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TxState {
    /// No actions registered yet
    Empty,
    /// At least one action registered, not yet run
    Populated,
    /// `run()` in progress
    Running,
    /// Every action applied
    Committed,
    /// Applied actions were undone (or the transaction was abandoned)
    RolledBack,
    /// Actions released; the transaction can no longer be used
    Cleaned,
}

impl TxState {
    /// Returns true if `add()` is accepted in this state
    #[inline]
    pub const fn accepts_actions(self) -> bool {
        matches!(self, Self::Empty | Self::Populated)
    }
}

/// A forward operation that failed.
#[derive(Debug, Error)]
#[error("{action} failed: {cause:#}")]
pub struct ActionFailure {
    pub action: String,
    pub cause: anyhow::Error,
}

/// A compensating operation that failed during rollback.
#[derive(Debug, Error)]
#[error("rollback of {action} failed: {cause:#}")]
pub struct UndoFailure {
    pub action: String,
    pub cause: anyhow::Error,
}

/// Every compensation that failed during one rollback walk, in walk order.
#[derive(Debug, Error)]
#[error("{}", join_failures(.failures))]
pub struct RollbackError {
    pub failures: Vec<UndoFailure>,
}

impl RollbackError {
    /// Names of the actions whose undo failed, in walk order
    pub fn failed_actions(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.action.as_str()).collect()
    }
}

fn join_failures(failures: &[UndoFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn rollback_suffix(rollback: &Option<RollbackError>) -> String {
    match rollback {
        Some(err) => format!("; {}", err),
        None => String::new(),
    }
}

/// Errors reported by the transaction engine
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Operation not valid in the current state
    #[error("Cannot {op} a transaction in state {state}")]
    InvalidState { op: &'static str, state: TxState },

    /// An action failed; everything before it was rolled back
    #[error("{failure}{}", rollback_suffix(.rollback))]
    Aborted {
        failure: ActionFailure,
        /// Compensations that failed while rolling back, if any
        rollback: Option<RollbackError>,
    },

    /// An explicit revert of a committed transaction left failures behind
    #[error(transparent)]
    Rollback(#[from] RollbackError),
}

impl TransactionError {
    /// Name of the action whose forward operation failed, if any
    pub fn failed_action(&self) -> Option<&str> {
        match self {
            Self::Aborted { failure, .. } => Some(&failure.action),
            _ => None,
        }
    }

    /// Rollback failures attached to this error, if any
    pub fn rollback_failures(&self) -> Option<&RollbackError> {
        match self {
            Self::Aborted { rollback, .. } => rollback.as_ref(),
            Self::Rollback(err) => Some(err),
            Self::InvalidState { .. } => None,
        }
    }
}

/// Ordered list of reversible actions with rollback on first failure.
///
/// # Example
///
/// ```
/// use mimo_update::engine::{Action, Transaction, TxState};
///
/// let mut txn = Transaction::new();
/// txn.add(Action::from_fns("first", || Ok(()), || Ok(()))).unwrap();
/// txn.add(None).unwrap(); // absent actions are ignored
///
/// txn.run().unwrap();
/// assert_eq!(txn.state(), TxState::Committed);
///
/// txn.cleanup();
/// assert!(txn.run().is_err());
/// ```
pub struct Transaction {
    /// Registered actions; insertion order is execution order
    actions: Vec<Action>,

    /// Length of the prefix of `actions` whose forward operation succeeded
    executed: usize,

    state: TxState,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create an empty transaction
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            executed: 0,
            state: TxState::Empty,
        }
    }

    /// Returns the current lifecycle state
    #[inline]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of registered actions
    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no actions are registered
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Names of all registered actions in execution order
    pub fn pending_names(&self) -> Vec<&str> {
        self.actions.iter().map(Action::name).collect()
    }

    /// Names of the actions that applied successfully and are still
    /// eligible for rollback, in execution order
    pub fn executed_names(&self) -> Vec<&str> {
        self.actions[..self.executed].iter().map(Action::name).collect()
    }

    /// Append an action.
    ///
    /// `None` is ignored. Adding after `run()` or `cleanup()` is rejected.
    pub fn add(&mut self, action: impl Into<Option<Action>>) -> Result<(), TransactionError> {
        let Some(action) = action.into() else {
            debug!("Ignoring absent action");
            return Ok(());
        };

        if !self.state.accepts_actions() {
            return Err(TransactionError::InvalidState {
                op: "add to",
                state: self.state,
            });
        }

        debug!("Registered action: {}", action.name());
        self.actions.push(action);
        self.state = TxState::Populated;
        Ok(())
    }

    /// Apply every action in order.
    ///
    /// On the first failure the remaining actions are skipped, everything
    /// already applied is rolled back, and the error names the failed action,
    /// its cause, and any compensation that failed.
    pub fn run(&mut self) -> Result<(), TransactionError> {
        if !self.state.accepts_actions() {
            return Err(TransactionError::InvalidState {
                op: "run",
                state: self.state,
            });
        }

        self.state = TxState::Running;
        self.executed = 0;
        info!("Running transaction with {} action(s)", self.actions.len());

        for idx in 0..self.actions.len() {
            let action = &self.actions[idx];
            info!("[{}/{}] {}", idx + 1, self.actions.len(), action.name());

            if let Err(cause) = action.apply() {
                let failure = ActionFailure {
                    action: action.name().to_string(),
                    cause,
                };
                error!("{}", failure);

                let rollback = self.rollback().err();
                return Err(TransactionError::Aborted { failure, rollback });
            }

            self.executed = idx + 1;
        }

        self.state = TxState::Committed;
        info!("Transaction committed");
        Ok(())
    }

    /// Undo every executed action in reverse order.
    ///
    /// Every compensation is attempted even if earlier ones fail. The executed
    /// list is cleared afterwards regardless of the outcome.
    ///
    /// Against a committed transaction this is a no-op: use
    /// `revert_committed()` to reverse a finished script on purpose. Calling
    /// it before `run()` abandons the transaction.
    pub fn rollback(&mut self) -> Result<(), RollbackError> {
        match self.state {
            TxState::Committed => {
                debug!("Rollback requested on a committed transaction, nothing to do");
                Ok(())
            }
            TxState::Cleaned | TxState::RolledBack => Ok(()),
            TxState::Empty | TxState::Populated | TxState::Running => {
                let result = self.undo_executed();
                self.state = TxState::RolledBack;
                result
            }
        }
    }

    /// Explicitly undo a committed transaction.
    pub fn revert_committed(&mut self) -> Result<(), TransactionError> {
        if self.state != TxState::Committed {
            return Err(TransactionError::InvalidState {
                op: "revert",
                state: self.state,
            });
        }

        info!("Reverting committed transaction");
        let result = self.undo_executed();
        self.state = TxState::RolledBack;
        result.map_err(TransactionError::from)
    }

    /// Release every action.
    ///
    /// Committed actions get a chance to discard their backups first. The
    /// transaction rejects `add()`/`run()` afterwards.
    pub fn cleanup(&mut self) {
        if self.state == TxState::Committed {
            for action in &self.actions {
                if let Err(e) = action.finish() {
                    warn!("Failed to discard backup for {}: {:#}", action.name(), e);
                }
            }
        }

        self.actions.clear();
        self.executed = 0;
        self.state = TxState::Cleaned;
    }

    fn undo_executed(&mut self) -> Result<(), RollbackError> {
        if self.executed > 0 {
            warn!("Rolling back {} action(s)", self.executed);
        }

        let mut failures = Vec::new();
        for action in self.actions[..self.executed].iter().rev() {
            info!("Undoing: {}", action.name());
            if let Err(cause) = action.undo() {
                let failure = UndoFailure {
                    action: action.name().to_string(),
                    cause,
                };
                error!("{}", failure);
                failures.push(failure);
            }
        }
        self.executed = 0;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RollbackError { failures })
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("pending", &self.pending_names())
            .field("executed", &self.executed_names())
            .finish()
    }
}
