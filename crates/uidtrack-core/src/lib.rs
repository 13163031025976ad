//! Core UID tracking for uidtrack
//!
//! Provides UID allocation, mailbox change tracking and the listener model
//! sessions use to learn about changes.

mod allocator;
mod error;
mod flags;
mod listener;
mod mailbox;
mod tracker;
mod uid;

pub use allocator::{MemoryUidCounter, UidAllocator, UidCounter};
pub use error::{CoreError, CoreResult};
pub use flags::{Flag, FlagSet};
pub use listener::{ChannelListener, ListenerId, MailboxEvent, MailboxListener};
pub use mailbox::{MailboxSource, MemoryMailbox};
pub use tracker::{ChangeSet, ChangeTracker, MessageView};
pub use uid::{Uid, UidRange, UidValidity};
