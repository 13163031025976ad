//! Background task that keeps a change tracker in step with a mailbox

use crate::WatcherConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uidtrack_core::{ChangeSet, ChangeTracker, CoreResult, MailboxSource, UidRange};

/// Commands sent to a mailbox watcher
#[derive(Debug, Clone)]
pub enum WatchCommand {
    /// Reconcile a UID range now
    Poll { range: UidRange },
    /// Reconcile the whole mailbox now
    PollAll,
    /// Stop the watcher
    Shutdown,
}

/// Events sent from a mailbox watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A poll found changes, which were delivered to listeners
    Changed {
        mailbox: String,
        added: usize,
        expunged: usize,
        flags_updated: usize,
    },
    /// A poll failed
    PollFailed { mailbox: String, error: String },
}

/// Polls a mailbox and feeds each view to its change tracker
pub struct MailboxWatcher {
    mailbox: String,
    source: Arc<dyn MailboxSource>,
    tracker: Arc<ChangeTracker>,
    config: WatcherConfig,
    command_rx: mpsc::Receiver<WatchCommand>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl MailboxWatcher {
    /// Create a new watcher
    pub fn new(
        mailbox: impl Into<String>,
        source: Arc<dyn MailboxSource>,
        tracker: Arc<ChangeTracker>,
        config: WatcherConfig,
        command_rx: mpsc::Receiver<WatchCommand>,
        event_tx: mpsc::Sender<WatchEvent>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            source,
            tracker,
            config,
            command_rx,
            event_tx,
        }
    }

    /// Run until shut down or every command sender is dropped
    pub async fn run(mut self) {
        info!("Watcher started for {}", self.mailbox);

        let mut ticker = self.config.poll_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let command = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    command = self.command_rx.recv() => command,
                    _ = ticker.tick() => Some(WatchCommand::PollAll),
                },
                None => self.command_rx.recv().await,
            };

            match command {
                Some(WatchCommand::Poll { range }) => self.poll(range).await,
                Some(WatchCommand::PollAll) => self.poll(UidRange::all()).await,
                Some(WatchCommand::Shutdown) | None => {
                    info!("Watcher for {} shutting down", self.mailbox);
                    break;
                }
            }
        }

        info!("Watcher stopped for {}", self.mailbox);
    }

    async fn poll(&mut self, range: UidRange) {
        match self.reconcile(range).await {
            Ok(changes) if changes.is_empty() => {}
            Ok(changes) => {
                let _ = self
                    .event_tx
                    .send(WatchEvent::Changed {
                        mailbox: self.mailbox.clone(),
                        added: changes.added.len(),
                        expunged: changes.expunged.len(),
                        flags_updated: changes.flags_updated.len(),
                    })
                    .await;
            }
            Err(e) => {
                error!("Error polling {} {}: {}", self.mailbox, range, e);
                let _ = self
                    .event_tx
                    .send(WatchEvent::PollFailed {
                        mailbox: self.mailbox.clone(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn reconcile(&self, range: UidRange) -> CoreResult<ChangeSet> {
        debug!("Polling {} {}", self.mailbox, range);
        let view = self.source.fetch_view(range).await?;
        self.tracker.reconcile(range, &view)
    }
}

/// Create watcher channels sized by `config`
/// Returns (command_sender, command_receiver, event_sender, event_receiver)
pub fn create_watch_channels(
    config: &WatcherConfig,
) -> (
    mpsc::Sender<WatchCommand>,
    mpsc::Receiver<WatchCommand>,
    mpsc::Sender<WatchEvent>,
    mpsc::Receiver<WatchEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<WatchCommand>(config.command_buffer);
    let (evt_tx, evt_rx) = mpsc::channel::<WatchEvent>(config.event_buffer);
    (cmd_tx, cmd_rx, evt_tx, evt_rx)
}
