//! Error handling module for mimo-update
//!
//! Provides the crate-level error type used by the orchestration layer.
//! The transaction engine has its own typed errors in `engine`; they convert
//! into `UpdaterError` when they cross into the updater.

use thiserror::Error;

use crate::engine::TransactionError;

/// Main error type for the updater
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// IO errors (file operations, lock files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource bundle errors (checksum mismatch, extraction)
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Pre-condition errors (not root, missing helper, another run active)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Registrar failed while capturing state, before anything ran
    #[error("Failed to register {registrar} actions: {cause:#}")]
    Register {
        registrar: &'static str,
        cause: anyhow::Error,
    },

    /// The update transaction failed (and was rolled back)
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The stopped storage target could not be relaunched
    #[error("Failed to restart MIMO target: {0}")]
    Restart(String),
}

/// Result type alias for updater operations
pub type Result<T> = std::result::Result<T, UpdaterError>;

impl UpdaterError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a bundle error
    pub fn bundle(msg: impl Into<String>) -> Self {
        Self::Bundle(msg.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Wrap a registrar capture failure
    pub fn register(registrar: &'static str, cause: anyhow::Error) -> Self {
        Self::Register { registrar, cause }
    }
}
