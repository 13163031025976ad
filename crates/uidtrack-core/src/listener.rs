//! Change listeners and the registry a tracker delivers to

use crate::{CoreError, CoreResult, FlagSet, Uid};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Receives change notifications from a [`crate::ChangeTracker`].
///
/// Callbacks run synchronously on the thread calling `reconcile`, while the
/// tracker's lock is held. An error aborts delivery for the rest of that
/// call and is returned to its caller. Implementations must not call
/// `reconcile` on the tracker that is notifying them.
pub trait MailboxListener: Send + Sync {
    /// A message with a UID above the tracker's previous high-water mark
    fn message_added(&self, uid: Uid) -> CoreResult<()>;

    /// A previously known message disappeared from the queried range
    fn message_expunged(&self, uid: Uid) -> CoreResult<()>;

    /// A known message's flags changed (ignoring `\Recent`)
    fn flags_updated(&self, uid: Uid, flags: &FlagSet) -> CoreResult<()>;
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    Added(Uid),
    Expunged(Uid),
    FlagsUpdated { uid: Uid, flags: FlagSet },
}

impl MailboxEvent {
    pub fn uid(&self) -> Uid {
        match self {
            MailboxEvent::Added(uid) | MailboxEvent::Expunged(uid) => *uid,
            MailboxEvent::FlagsUpdated { uid, .. } => *uid,
        }
    }

    /// Forward this event to a listener
    pub fn deliver(&self, listener: &dyn MailboxListener) -> CoreResult<()> {
        match self {
            MailboxEvent::Added(uid) => listener.message_added(*uid),
            MailboxEvent::Expunged(uid) => listener.message_expunged(*uid),
            MailboxEvent::FlagsUpdated { uid, flags } => listener.flags_updated(*uid, flags),
        }
    }
}

/// Listener that hands every notification off to an async channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<MailboxEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MailboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: MailboxEvent) -> CoreResult<()> {
        self.tx
            .send(event)
            .map_err(|e| CoreError::Listener(format!("event receiver closed, dropped {:?}", e.0)))
    }
}

impl MailboxListener for ChannelListener {
    fn message_added(&self, uid: Uid) -> CoreResult<()> {
        self.send(MailboxEvent::Added(uid))
    }

    fn message_expunged(&self, uid: Uid) -> CoreResult<()> {
        self.send(MailboxEvent::Expunged(uid))
    }

    fn flags_updated(&self, uid: Uid, flags: &FlagSet) -> CoreResult<()> {
        self.send(MailboxEvent::FlagsUpdated {
            uid,
            flags: flags.clone(),
        })
    }
}

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of listeners, safe to mutate while deliveries are in flight
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MailboxListener>)>>,
}

impl ListenerSet {
    pub(crate) fn register(&self, listener: Arc<dyn MailboxListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Copy of the current registrations, in registration order
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn MailboxListener>> {
        self.read().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }

    // A poisoned registry only means a registering thread panicked; the Vec
    // itself is always in a consistent state.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ListenerId, Arc<dyn MailboxListener>)>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ListenerId, Arc<dyn MailboxListener>)>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}
