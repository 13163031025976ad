//! Error types for the core module

use crate::Uid;
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// The backing UID counter was advanced by a concurrent writer.
    /// The caller must retry the whole allocate-and-append operation.
    #[error("UID allocation conflict: counter moved past version {expected_version}")]
    PersistenceConflict { expected_version: u64 },

    /// Caller supplied data that breaks a precondition
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A registered listener failed while receiving a change notification
    #[error("Listener error: {0}")]
    Listener(String),

    /// Message not found
    #[error("Message not found: UID {0}")]
    MessageNotFound(Uid),

    /// Mailbox not found in the backing store
    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    /// The counter cannot issue any more UIDs under the current UIDVALIDITY
    #[error("UID space exhausted")]
    UidExhausted,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Shorthand for building a [`CoreError::ContractViolation`]
    pub fn contract(message: impl Into<String>) -> Self {
        CoreError::ContractViolation(message.into())
    }

    /// Check whether retrying the failed operation can succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::PersistenceConflict { .. })
    }
}
