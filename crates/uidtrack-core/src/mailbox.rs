//! Mailbox views and an in-memory mailbox

use crate::{
    CoreError, CoreResult, Flag, FlagSet, MessageView, Uid, UidAllocator, UidRange, UidValidity,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

/// Something that can report the current messages of a mailbox
#[async_trait]
pub trait MailboxSource: Send + Sync {
    /// Messages within `range`, sorted by ascending UID
    async fn fetch_view(&self, range: UidRange) -> CoreResult<Vec<MessageView>>;
}

/// A mailbox held entirely in memory.
///
/// New messages get their UID from the mailbox's [`UidAllocator`] before they
/// become visible to [`MailboxSource::fetch_view`]. Appends are serialized so
/// messages become visible in UID order.
#[derive(Debug)]
pub struct MemoryMailbox {
    name: String,
    allocator: UidAllocator,
    messages: RwLock<BTreeMap<Uid, FlagSet>>,
    append_lock: Mutex<()>,
}

impl MemoryMailbox {
    pub fn new(name: impl Into<String>, allocator: UidAllocator) -> Self {
        Self {
            name: name.into(),
            allocator,
            messages: RwLock::new(BTreeMap::new()),
            append_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid_validity(&self) -> UidValidity {
        self.allocator.uid_validity()
    }

    /// The UID the next appended message will receive at the earliest
    pub async fn uid_next(&self) -> CoreResult<u64> {
        Ok(self.allocator.last_uid().await?.saturating_add(1))
    }

    /// Append a message, returning its UID.
    ///
    /// The message is marked `\Recent` in addition to `flags`. A
    /// [`CoreError::PersistenceConflict`] from the allocator is returned as
    /// is and nothing is inserted.
    pub async fn append(&self, flags: FlagSet) -> CoreResult<Uid> {
        // A lower UID must never show up after a higher one was reconciled,
        // or the tracker adopts it silently.
        let _append = self.append_lock.lock().await;
        let uid = self.allocator.consume_next_uid().await?;
        let mut flags = flags;
        flags.insert(Flag::Recent);
        self.write().insert(uid, flags);
        debug!("Appended UID {} to {}", uid, self.name);
        Ok(uid)
    }

    /// Replace the flags of an existing message
    pub fn store_flags(&self, uid: Uid, flags: FlagSet) -> CoreResult<()> {
        let mut messages = self.write();
        let entry = messages
            .get_mut(&uid)
            .ok_or(CoreError::MessageNotFound(uid))?;
        *entry = flags;
        Ok(())
    }

    /// Remove a message permanently
    pub fn expunge(&self, uid: Uid) -> CoreResult<()> {
        self.write()
            .remove(&uid)
            .map(|_| debug!("Expunged UID {} from {}", uid, self.name))
            .ok_or(CoreError::MessageNotFound(uid))
    }

    /// Remove every message carrying `\Deleted`, returning their UIDs
    pub fn expunge_deleted(&self) -> Vec<Uid> {
        let mut messages = self.write();
        let doomed: Vec<Uid> = messages
            .iter()
            .filter(|(_, flags)| flags.contains(&Flag::Deleted))
            .map(|(uid, _)| *uid)
            .collect();
        for uid in &doomed {
            messages.remove(uid);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Uid, FlagSet>> {
        self.messages.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Uid, FlagSet>> {
        self.messages.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MailboxSource for MemoryMailbox {
    async fn fetch_view(&self, range: UidRange) -> CoreResult<Vec<MessageView>> {
        Ok(self
            .read()
            .range(range.start()..=range.end())
            .map(|(uid, flags)| MessageView::new(*uid, flags.clone()))
            .collect())
    }
}
