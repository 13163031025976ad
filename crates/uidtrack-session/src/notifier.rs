//! Per-session translation of mailbox changes into unsolicited responses

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::{info, trace, warn};
use uidtrack_core::{
    ChangeTracker, CoreError, CoreResult, FlagSet, ListenerId, MailboxListener, Uid,
};

/// An unsolicited response a session owes its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsolicitedResponse {
    /// New message count after an addition
    Exists(u32),
    /// Sequence number of a removed message, numbered before its removal
    Expunge(u32),
    /// New flags of a message
    Fetch { seq: u32, uid: Uid, flags: FlagSet },
}

impl fmt::Display for UnsolicitedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsolicitedResponse::Exists(count) => write!(f, "* {} EXISTS", count),
            UnsolicitedResponse::Expunge(seq) => write!(f, "* {} EXPUNGE", seq),
            UnsolicitedResponse::Fetch { seq, uid, flags } => {
                write!(f, "* {} FETCH (UID {} FLAGS {})", seq, uid, flags)
            }
        }
    }
}

/// Listener representing one selected session.
///
/// Keeps the session's view of the mailbox as an ascending list of UIDs,
/// where a message's sequence number is its index plus one.
///
/// A notifier created with [`SessionNotifier::attach`] unregisters itself
/// once its receiver is dropped, so a disconnected session never blocks
/// delivery to the others.
pub struct SessionNotifier {
    session: String,
    visible: Mutex<Vec<Uid>>,
    tx: mpsc::UnboundedSender<UnsolicitedResponse>,
    registration: OnceLock<(Weak<ChangeTracker>, ListenerId)>,
}

impl SessionNotifier {
    /// Create a notifier for a session that currently sees `visible`
    pub fn new(
        session: impl Into<String>,
        mut visible: Vec<Uid>,
    ) -> (Self, mpsc::UnboundedReceiver<UnsolicitedResponse>) {
        visible.sort_unstable();
        visible.dedup();
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self {
            session: session.into(),
            visible: Mutex::new(visible),
            tx,
            registration: OnceLock::new(),
        };
        (notifier, rx)
    }

    /// Select a mailbox: start from the tracker's known messages and register
    /// for every change after them
    pub fn attach(
        session: impl Into<String>,
        tracker: &Arc<ChangeTracker>,
    ) -> (
        Arc<Self>,
        ListenerId,
        mpsc::UnboundedReceiver<UnsolicitedResponse>,
    ) {
        let session = session.into();
        let mut receiver = None;
        let (notifier, id) = tracker.register_with(|known| {
            let (notifier, rx) = SessionNotifier::new(session, known);
            receiver = Some(rx);
            notifier
        });
        let _ = notifier.registration.set((Arc::downgrade(tracker), id));
        // register_with always runs the builder
        let rx = receiver.unwrap_or_else(|| mpsc::unbounded_channel().1);
        (notifier, id, rx)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Number of messages the session can see
    pub fn exists(&self) -> usize {
        self.lock().len()
    }

    /// Sequence number of `uid` in this session
    pub fn sequence_number(&self, uid: Uid) -> Option<u32> {
        let visible = self.lock();
        visible
            .binary_search(&uid)
            .ok()
            .and_then(|index| u32::try_from(index + 1).ok())
    }

    fn send(&self, response: UnsolicitedResponse) -> CoreResult<()> {
        trace!("[{}] {}", self.session, response);
        if self.tx.send(response).is_ok() {
            return Ok(());
        }

        let Some((tracker, id)) = self.registration.get() else {
            return Err(CoreError::Listener(format!(
                "session {} is closed",
                self.session
            )));
        };
        if let Some(tracker) = tracker.upgrade() {
            tracker.unregister(*id);
        }
        info!("[{}] session closed, detached from mailbox", self.session);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Uid>> {
        self.visible.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_seq(index: usize) -> CoreResult<u32> {
    u32::try_from(index + 1)
        .map_err(|_| CoreError::Listener(format!("sequence number {} out of range", index + 1)))
}

impl MailboxListener for SessionNotifier {
    fn message_added(&self, uid: Uid) -> CoreResult<()> {
        let mut visible = self.lock();
        match visible.binary_search(&uid) {
            Ok(_) => {
                warn!("[{}] UID {} added twice, ignoring", self.session, uid);
                return Ok(());
            }
            Err(index) => visible.insert(index, uid),
        }
        let count = u32::try_from(visible.len())
            .map_err(|_| CoreError::Listener(format!("session {} is too large", self.session)))?;
        self.send(UnsolicitedResponse::Exists(count))
    }

    fn message_expunged(&self, uid: Uid) -> CoreResult<()> {
        let mut visible = self.lock();
        let Ok(index) = visible.binary_search(&uid) else {
            warn!("[{}] expunge for unknown UID {}, ignoring", self.session, uid);
            return Ok(());
        };
        let seq = to_seq(index)?;
        visible.remove(index);
        self.send(UnsolicitedResponse::Expunge(seq))
    }

    fn flags_updated(&self, uid: Uid, flags: &FlagSet) -> CoreResult<()> {
        let visible = self.lock();
        let Ok(index) = visible.binary_search(&uid) else {
            warn!("[{}] flag update for unknown UID {}, ignoring", self.session, uid);
            return Ok(());
        };
        self.send(UnsolicitedResponse::Fetch {
            seq: to_seq(index)?,
            uid,
            flags: flags.without_recent(),
        })
    }
}
