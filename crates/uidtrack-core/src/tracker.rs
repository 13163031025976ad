//! Change tracking between successive views of a mailbox
//!
//! A [`ChangeTracker`] remembers the last server-side view of a mailbox and,
//! given a fresh view of a UID range, works out which messages were added,
//! expunged or had their flags changed. Listeners are told about each change
//! exactly once, in the order an IMAP session needs to emit its unsolicited
//! responses: every EXISTS, then every EXPUNGE, then every FETCH.

use crate::listener::ListenerSet;
use crate::{
    CoreError, CoreResult, FlagSet, ListenerId, MailboxEvent, MailboxListener, Uid, UidRange,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// One message as seen by a mailbox query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub uid: Uid,
    pub flags: FlagSet,
}

impl MessageView {
    pub fn new(uid: Uid, flags: FlagSet) -> Self {
        Self { uid, flags }
    }
}

/// The delta produced by a single [`ChangeTracker::reconcile`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// New UIDs, ascending
    pub added: Vec<Uid>,
    /// Expunged UIDs, ascending
    pub expunged: Vec<Uid>,
    /// UIDs whose significant flags changed, with their new flags, ascending
    pub flags_updated: Vec<(Uid, FlagSet)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.expunged.is_empty() && self.flags_updated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.expunged.len() + self.flags_updated.len()
    }

    /// Events in delivery order
    pub fn events(&self) -> impl Iterator<Item = MailboxEvent> + '_ {
        let added = self.added.iter().map(|uid| MailboxEvent::Added(*uid));
        let expunged = self.expunged.iter().map(|uid| MailboxEvent::Expunged(*uid));
        let updated = self
            .flags_updated
            .iter()
            .map(|(uid, flags)| MailboxEvent::FlagsUpdated {
                uid: *uid,
                flags: flags.clone(),
            });
        added.chain(expunged).chain(updated)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Highest UID seen so far, 0 when none
    last_uid: u64,
    known: BTreeMap<Uid, FlagSet>,
}

impl TrackerState {
    /// Compute the delta against `view` and commit it.
    ///
    /// `view` must already be validated against `range`.
    fn apply(&mut self, range: UidRange, view: &[MessageView]) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for message in view {
            if message.uid.get() > self.last_uid {
                changes.added.push(message.uid);
            }
        }

        changes.expunged = self
            .known
            .range(range.start()..=range.end())
            .map(|(uid, _)| *uid)
            .filter(|uid| view.binary_search_by_key(uid, |m| m.uid).is_err())
            .collect();

        for message in view {
            if let Some(previous) = self.known.get(&message.uid) {
                if !previous.significant_eq(&message.flags) {
                    changes
                        .flags_updated
                        .push((message.uid, message.flags.clone()));
                }
            }
        }

        for uid in &changes.expunged {
            self.known.remove(uid);
        }
        // Also adopts UIDs at or below last_uid that were never seen before,
        // and refreshes \Recent on unchanged messages.
        for message in view {
            self.known.insert(message.uid, message.flags.clone());
        }
        if let Some(highest) = changes.added.last() {
            self.last_uid = highest.get();
        }

        changes
    }
}

/// Tracks the known state of one mailbox and notifies listeners of changes.
///
/// One tracker is shared by every session that has the mailbox selected.
/// `reconcile` calls are serialized by an internal lock, so concurrent
/// callers never see interleaved or duplicated events.
pub struct ChangeTracker {
    state: Mutex<TrackerState>,
    listeners: ListenerSet,
}

impl ChangeTracker {
    /// Create a tracker that treats every UID above `last_uid` as new
    pub fn new(last_uid: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                last_uid,
                known: BTreeMap::new(),
            }),
            listeners: ListenerSet::default(),
        }
    }

    /// Register a listener for future changes
    pub fn register(&self, listener: Arc<dyn MailboxListener>) -> ListenerId {
        let id = self.listeners.register(listener);
        debug!("Registered listener {:?}", id);
        id
    }

    /// Register a listener built from the currently known UIDs.
    ///
    /// The snapshot and the registration happen under the reconcile lock, so
    /// the listener sees every change after the state it was built from and
    /// none before it. `build` must not call back into this tracker.
    pub fn register_with<L, F>(&self, build: F) -> (Arc<L>, ListenerId)
    where
        L: MailboxListener + 'static,
        F: FnOnce(Vec<Uid>) -> L,
    {
        let state = self.lock_state();
        let listener = Arc::new(build(state.known.keys().copied().collect()));
        let id = self.listeners.register(listener.clone());
        drop(state);
        debug!("Registered listener {:?} with snapshot", id);
        (listener, id)
    }

    /// Remove a listener, returning whether it was registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = self.listeners.unregister(id);
        debug!("Unregistered listener {:?} (found: {})", id, removed);
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Diff `view` against the known state for `range` and notify listeners.
    ///
    /// `view` must be sorted by ascending UID, free of duplicates, and hold
    /// only UIDs within `range`; anything else is a
    /// [`CoreError::ContractViolation`] and leaves the tracker untouched.
    ///
    /// The known state is committed before delivery starts. If a listener
    /// fails, delivery stops and the error is returned; the undelivered
    /// events are not replayed by later calls.
    pub fn reconcile(&self, range: UidRange, view: &[MessageView]) -> CoreResult<ChangeSet> {
        validate_view(range, view)?;

        let mut state = self.lock_state();
        let listeners = self.listeners.snapshot();
        let changes = state.apply(range, view);

        if changes.is_empty() {
            trace!("Reconciled {}: no changes", range);
            return Ok(changes);
        }

        debug!(
            "Reconciled {}: {} added, {} expunged, {} flag updates, {} listeners",
            range,
            changes.added.len(),
            changes.expunged.len(),
            changes.flags_updated.len(),
            listeners.len()
        );

        for event in changes.events() {
            for listener in &listeners {
                event.deliver(listener.as_ref())?;
            }
        }
        drop(state);

        Ok(changes)
    }

    /// Forget every known message without notifying anyone.
    ///
    /// Used when the mailbox's UIDVALIDITY changed and old UIDs are void.
    pub fn reset(&self, last_uid: u64) {
        let mut state = self.lock_state();
        debug!(
            "Resetting tracker: dropping {} known messages, last UID {} -> {}",
            state.known.len(),
            state.last_uid,
            last_uid
        );
        state.known.clear();
        state.last_uid = last_uid;
    }

    /// Highest UID seen so far (0 when none)
    pub fn last_uid(&self) -> u64 {
        self.lock_state().last_uid
    }

    /// Known UIDs, ascending
    pub fn known_uids(&self) -> Vec<Uid> {
        self.lock_state().known.keys().copied().collect()
    }

    /// Last known flags of `uid`
    pub fn flags_of(&self, uid: Uid) -> Option<FlagSet> {
        self.lock_state().known.get(&uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_state().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().known.is_empty()
    }

    // State is committed before any listener runs, so a panicking listener
    // cannot leave it half-updated.
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ChangeTracker")
            .field("last_uid", &state.last_uid)
            .field("known", &state.known.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn validate_view(range: UidRange, view: &[MessageView]) -> CoreResult<()> {
    if let Some(outside) = view.iter().find(|m| !range.contains(m.uid)) {
        return Err(CoreError::contract(format!(
            "UID {} is outside the queried range {}",
            outside.uid, range
        )));
    }
    if let Some(pair) = view.windows(2).find(|pair| pair[0].uid >= pair[1].uid) {
        return Err(CoreError::contract(format!(
            "view is not strictly ascending at UID {} followed by {}",
            pair[0].uid, pair[1].uid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flag;
    use std::sync::{Barrier, OnceLock};
    use std::thread;

    fn uid(n: u64) -> Uid {
        Uid::new(n).unwrap()
    }

    fn range(start: u64, end: u64) -> UidRange {
        UidRange::from_raw(start, end).unwrap()
    }

    fn msg<const N: usize>(n: u64, flags: [Flag; N]) -> MessageView {
        MessageView::new(uid(n), FlagSet::from(flags))
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<MailboxEvent>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<MailboxEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: MailboxEvent) -> CoreResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl MailboxListener for Recorder {
        fn message_added(&self, uid: Uid) -> CoreResult<()> {
            self.push(MailboxEvent::Added(uid))
        }

        fn message_expunged(&self, uid: Uid) -> CoreResult<()> {
            self.push(MailboxEvent::Expunged(uid))
        }

        fn flags_updated(&self, uid: Uid, flags: &FlagSet) -> CoreResult<()> {
            self.push(MailboxEvent::FlagsUpdated {
                uid,
                flags: flags.clone(),
            })
        }
    }

    struct Failing;

    impl MailboxListener for Failing {
        fn message_added(&self, uid: Uid) -> CoreResult<()> {
            Err(CoreError::Listener(format!("session gone before EXISTS for {}", uid)))
        }

        fn message_expunged(&self, _uid: Uid) -> CoreResult<()> {
            Err(CoreError::Listener("session gone".into()))
        }

        fn flags_updated(&self, _uid: Uid, _flags: &FlagSet) -> CoreResult<()> {
            Err(CoreError::Listener("session gone".into()))
        }
    }

    fn tracker_with_recorder(last_uid: u64) -> (ChangeTracker, Arc<Recorder>) {
        let tracker = ChangeTracker::new(last_uid);
        let recorder = Arc::new(Recorder::default());
        tracker.register(recorder.clone());
        (tracker, recorder)
    }

    #[test]
    fn test_add_expunge_scenario() {
        let (tracker, recorder) = tracker_with_recorder(999);

        tracker.reconcile(range(1000, 1000), &[msg(1000, [])]).unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Added(uid(1000))]);

        tracker
            .reconcile(range(1001, 1001), &[msg(1001, [Flag::Flagged])])
            .unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Added(uid(1001))]);

        tracker
            .reconcile(range(1001, 1001), &[msg(1001, [Flag::Flagged])])
            .unwrap();
        assert!(recorder.take().is_empty());

        let changes = tracker
            .reconcile(range(1000, 1001), &[msg(1001, [Flag::Flagged])])
            .unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Expunged(uid(1000))]);
        assert_eq!(changes.expunged, vec![uid(1000)]);
        assert!(changes.added.is_empty());
        assert!(changes.flags_updated.is_empty());

        assert_eq!(tracker.known_uids(), vec![uid(1001)]);
        assert_eq!(tracker.last_uid(), 1001);
    }

    #[test]
    fn test_reconcile_twice_is_silent() {
        let (tracker, recorder) = tracker_with_recorder(0);
        let view = vec![msg(1, [Flag::Seen]), msg(2, []), msg(7, [Flag::Draft])];

        let first = tracker.reconcile(range(1, 10), &view).unwrap();
        assert_eq!(first.added, vec![uid(1), uid(2), uid(7)]);
        recorder.take();

        let second = tracker.reconcile(range(1, 10), &view).unwrap();
        assert!(second.is_empty());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_recent_only_changes_are_ignored() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker.reconcile(range(1, 2), &[msg(1, [Flag::Recent]), msg(2, [Flag::Recent])]).unwrap();
        recorder.take();

        tracker.reconcile(range(1, 1), &[msg(1, [])]).unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(tracker.flags_of(uid(1)), Some(FlagSet::new()));

        tracker.reconcile(range(2, 2), &[msg(2, [Flag::Seen])]).unwrap();
        assert_eq!(
            recorder.take(),
            vec![MailboxEvent::FlagsUpdated {
                uid: uid(2),
                flags: FlagSet::from([Flag::Seen]),
            }]
        );
    }

    #[test]
    fn test_event_class_ordering() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker
            .reconcile(range(1, 4), &[msg(2, []), msg(3, []), msg(4, [])])
            .unwrap();
        recorder.take();

        let view = vec![msg(3, [Flag::Seen]), msg(4, []), msg(5, [])];
        tracker.reconcile(range(1, 5), &view).unwrap();

        assert_eq!(
            recorder.take(),
            vec![
                MailboxEvent::Added(uid(5)),
                MailboxEvent::Expunged(uid(2)),
                MailboxEvent::FlagsUpdated {
                    uid: uid(3),
                    flags: FlagSet::from([Flag::Seen]),
                },
            ]
        );
    }

    #[test]
    fn test_events_ascending_within_class() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker
            .reconcile(range(1, 6), &[msg(1, []), msg(2, []), msg(3, []), msg(4, [])])
            .unwrap();
        recorder.take();

        tracker
            .reconcile(
                range(1, 8),
                &[msg(2, [Flag::Answered]), msg(4, [Flag::Deleted]), msg(6, []), msg(8, [])],
            )
            .unwrap();

        let uids: Vec<_> = recorder.take().iter().map(|e| e.uid().get()).collect();
        assert_eq!(uids, vec![6, 8, 1, 3, 2, 4]);
    }

    #[test]
    fn test_partial_range_does_not_expunge_outside() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker
            .reconcile(range(1000, 2000), &[msg(1000, []), msg(2000, [])])
            .unwrap();
        recorder.take();

        tracker.reconcile(range(1000, 1000), &[msg(1000, [])]).unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(tracker.known_uids(), vec![uid(1000), uid(2000)]);

        // An empty view of a window only expunges what the window covers
        tracker.reconcile(range(1500, 2500), &[]).unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Expunged(uid(2000))]);
        assert_eq!(tracker.known_uids(), vec![uid(1000)]);
    }

    #[test]
    fn test_older_uids_are_adopted_silently() {
        let (tracker, recorder) = tracker_with_recorder(50);
        tracker.reconcile(range(1, 60), &[msg(10, []), msg(55, [])]).unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Added(uid(55))]);
        assert_eq!(tracker.known_uids(), vec![uid(10), uid(55)]);

        tracker.reconcile(range(1, 60), &[msg(55, [])]).unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Expunged(uid(10))]);
    }

    #[test]
    fn test_contract_violations_leave_state_untouched() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker.reconcile(range(1, 3), &[msg(1, []), msg(2, [])]).unwrap();
        recorder.take();

        let outside = tracker.reconcile(range(1, 3), &[msg(1, []), msg(4, [])]);
        assert!(matches!(outside, Err(CoreError::ContractViolation(_))));

        let unsorted = tracker.reconcile(range(1, 3), &[msg(2, []), msg(1, [])]);
        assert!(matches!(unsorted, Err(CoreError::ContractViolation(_))));

        let duplicate = tracker.reconcile(range(1, 3), &[msg(2, []), msg(2, [Flag::Seen])]);
        assert!(matches!(duplicate, Err(CoreError::ContractViolation(_))));

        assert!(recorder.take().is_empty());
        assert_eq!(tracker.known_uids(), vec![uid(1), uid(2)]);
        assert_eq!(tracker.last_uid(), 2);
    }

    #[test]
    fn test_listener_failure_propagates_and_aborts() {
        let tracker = ChangeTracker::new(0);
        let before = Arc::new(Recorder::default());
        let after = Arc::new(Recorder::default());
        tracker.register(before.clone());
        tracker.register(Arc::new(Failing));
        tracker.register(after.clone());

        let result = tracker.reconcile(range(1, 2), &[msg(1, []), msg(2, [])]);
        assert!(matches!(result, Err(CoreError::Listener(_))));

        // Delivery stopped at the failing listener on the first event
        assert_eq!(before.take(), vec![MailboxEvent::Added(uid(1))]);
        assert!(after.take().is_empty());

        // The state was committed, so nothing is replayed
        assert_eq!(tracker.last_uid(), 2);
        let again = tracker.reconcile(range(1, 2), &[msg(1, []), msg(2, [])]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_multiple_listeners_and_unregister() {
        let tracker = ChangeTracker::new(0);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let id_a = tracker.register(a.clone());
        tracker.register(b.clone());

        tracker.reconcile(range(1, 1), &[msg(1, [])]).unwrap();
        assert_eq!(a.take(), vec![MailboxEvent::Added(uid(1))]);
        assert_eq!(b.take(), vec![MailboxEvent::Added(uid(1))]);

        assert!(tracker.unregister(id_a));
        tracker.reconcile(range(1, 2), &[msg(1, []), msg(2, [])]).unwrap();
        assert!(a.take().is_empty());
        assert_eq!(b.take(), vec![MailboxEvent::Added(uid(2))]);
        assert_eq!(tracker.listener_count(), 1);
    }

    /// Registers a second listener from inside a callback
    struct RegisteringListener {
        tracker: OnceLock<Arc<ChangeTracker>>,
        late: Arc<Recorder>,
        registered: Mutex<bool>,
    }

    impl MailboxListener for RegisteringListener {
        fn message_added(&self, _uid: Uid) -> CoreResult<()> {
            let mut registered = self.registered.lock().unwrap();
            if !*registered {
                if let Some(tracker) = self.tracker.get() {
                    tracker.register(self.late.clone());
                }
                *registered = true;
            }
            Ok(())
        }

        fn message_expunged(&self, _uid: Uid) -> CoreResult<()> {
            Ok(())
        }

        fn flags_updated(&self, _uid: Uid, _flags: &FlagSet) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registration_during_reconcile_uses_snapshot() {
        let tracker = Arc::new(ChangeTracker::new(0));
        let late = Arc::new(Recorder::default());
        let registering = Arc::new(RegisteringListener {
            tracker: OnceLock::new(),
            late: late.clone(),
            registered: Mutex::new(false),
        });
        let _ = registering.tracker.set(tracker.clone());
        tracker.register(registering);

        tracker.reconcile(range(1, 3), &[msg(1, []), msg(2, []), msg(3, [])]).unwrap();
        assert!(late.take().is_empty());
        assert_eq!(tracker.listener_count(), 2);

        tracker.reconcile(range(1, 4), &[msg(1, []), msg(2, []), msg(3, []), msg(4, [])]).unwrap();
        assert_eq!(late.take(), vec![MailboxEvent::Added(uid(4))]);
    }

    #[test]
    fn test_concurrent_overlapping_reconciles() {
        for _ in 0..50 {
            let tracker = Arc::new(ChangeTracker::new(0));
            let initial: Vec<_> = (1..=10).map(|n| msg(n, [])).collect();
            tracker.reconcile(range(1, 10), &initial).unwrap();

            let recorder = Arc::new(Recorder::default());
            tracker.register(recorder.clone());

            // Server state both callers observe: 3 expunged, 7 flagged, 11-12 appended
            let server: Vec<_> = (1..=12)
                .filter(|n| *n != 3)
                .map(|n| {
                    if n == 7 {
                        msg(n, [Flag::Flagged])
                    } else {
                        msg(n, [])
                    }
                })
                .collect();
            let wide = server.clone();
            let narrow: Vec<_> = server.iter().filter(|m| m.uid.get() >= 5).cloned().collect();

            let barrier = Arc::new(Barrier::new(2));
            let spawn = |window: UidRange, view: Vec<MessageView>| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    tracker.reconcile(window, &view).unwrap()
                })
            };
            let first = spawn(range(1, 12), wide);
            let second = spawn(range(5, 12), narrow);
            first.join().unwrap();
            second.join().unwrap();

            let mut events = recorder.take();
            events.sort_by_key(|e| e.uid());
            assert_eq!(
                events,
                vec![
                    MailboxEvent::Expunged(uid(3)),
                    MailboxEvent::FlagsUpdated {
                        uid: uid(7),
                        flags: FlagSet::from([Flag::Flagged]),
                    },
                    MailboxEvent::Added(uid(11)),
                    MailboxEvent::Added(uid(12)),
                ]
            );
            assert_eq!(tracker.last_uid(), 12);
            assert_eq!(tracker.len(), 11);
        }
    }

    #[test]
    fn test_register_with_snapshot() {
        let tracker = ChangeTracker::new(0);
        tracker.reconcile(range(1, 3), &[msg(1, []), msg(3, [])]).unwrap();

        let mut seen = Vec::new();
        let (recorder, _id) = tracker.register_with(|known| {
            seen = known;
            Recorder::default()
        });
        assert_eq!(seen, vec![uid(1), uid(3)]);

        tracker.reconcile(range(1, 4), &[msg(3, []), msg(4, [])]).unwrap();
        assert_eq!(
            recorder.take(),
            vec![MailboxEvent::Added(uid(4)), MailboxEvent::Expunged(uid(1))]
        );
    }

    #[test]
    fn test_reset_forgets_silently() {
        let (tracker, recorder) = tracker_with_recorder(0);
        tracker.reconcile(range(1, 2), &[msg(1, []), msg(2, [])]).unwrap();
        recorder.take();

        tracker.reset(0);
        assert!(tracker.is_empty());
        assert!(recorder.take().is_empty());

        tracker.reconcile(range(1, 1), &[msg(1, [])]).unwrap();
        assert_eq!(recorder.take(), vec![MailboxEvent::Added(uid(1))]);
    }
}
