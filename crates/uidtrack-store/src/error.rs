//! Error types for the UID store

use thiserror::Error;
use uidtrack_core::CoreError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The counter row was updated by someone else since it was read
    #[error("Counter version {expected_version} is stale")]
    Conflict { expected_version: u64 },

    /// No counter row for the mailbox
    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    /// The mailbox was recreated and this counter's UIDVALIDITY is void
    #[error("Mailbox {mailbox} was recreated: UIDVALIDITY {stale} superseded by {current}")]
    Superseded {
        mailbox: String,
        stale: u64,
        current: u64,
    },

    /// No more UIDs fit in the database column
    #[error("UID counter exhausted for {0}")]
    Exhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { expected_version } => {
                CoreError::PersistenceConflict { expected_version }
            }
            StoreError::MailboxNotFound(name) => CoreError::MailboxNotFound(name),
            StoreError::Superseded { mailbox, .. } => CoreError::MailboxNotFound(mailbox),
            StoreError::Exhausted(_) => CoreError::UidExhausted,
            other => CoreError::Storage(other.to_string()),
        }
    }
}
