//! Durable UID counters for uidtrack
//!
//! Stores one UID counter per mailbox in SQLite, advanced with an optimistic
//! version check.

mod counter;
mod error;

pub use counter::{CounterState, SqliteUidCounter, UidStore};
pub use error::{StoreError, StoreResult};
