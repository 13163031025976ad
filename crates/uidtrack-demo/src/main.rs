//! uidtrack demo
//!
//! Simulates two IMAP sessions watching one mailbox while messages are
//! appended, flagged and expunged, and prints the unsolicited responses each
//! session would send.
//!
//! Usage: `uidtrack-demo [config.json] [counters.sqlite]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uidtrack_core::{
    ChangeTracker, CoreResult, Flag, FlagSet, MemoryMailbox, Uid, UidAllocator, UidValidity,
};
use uidtrack_session::{
    create_watch_channels, MailboxWatcher, SessionNotifier, UnsolicitedResponse, WatchCommand,
    WatchEvent, WatcherConfig,
};
use uidtrack_store::UidStore;

const MAILBOX: &str = "INBOX";
const APPEND_ATTEMPTS: usize = 5;
const POLL_WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("uidtrack=debug".parse()?))
        .init();

    tracing::info!("Starting uidtrack demo");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => WatcherConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => WatcherConfig::default(),
    };

    let allocator = match args.next() {
        Some(path) => {
            let store = UidStore::open(&path).await?;
            UidAllocator::new(Arc::new(store.counter(MAILBOX).await?))
        }
        None => UidAllocator::in_memory(UidValidity::generate(None), 0),
    };
    tracing::info!(
        "{} has UIDVALIDITY {}",
        MAILBOX,
        allocator.uid_validity()
    );

    let tracker = Arc::new(ChangeTracker::new(allocator.last_uid().await?));
    let mailbox = Arc::new(MemoryMailbox::new(MAILBOX, allocator));

    let (_alice, _, mut alice_rx) = SessionNotifier::attach("alice", &tracker);
    let (_bob, _, mut bob_rx) = SessionNotifier::attach("bob", &tracker);

    let (cmd_tx, cmd_rx, evt_tx, mut evt_rx) = create_watch_channels(&config);
    let watcher = MailboxWatcher::new(
        MAILBOX,
        mailbox.clone(),
        tracker.clone(),
        config,
        cmd_rx,
        evt_tx,
    );
    let handle = tokio::spawn(watcher.run());

    let mut uids = Vec::new();
    for flags in [FlagSet::new(), FlagSet::from([Flag::Seen]), FlagSet::new()] {
        uids.push(append_with_retry(&mailbox, flags).await?);
    }
    step("append three messages", &cmd_tx, &mut evt_rx, &mut alice_rx, &mut bob_rx).await?;

    mailbox.store_flags(uids[0], FlagSet::from([Flag::Flagged]))?;
    mailbox.expunge(uids[1])?;
    uids.push(append_with_retry(&mailbox, FlagSet::new()).await?);
    step("flag, expunge and append", &cmd_tx, &mut evt_rx, &mut alice_rx, &mut bob_rx).await?;

    cmd_tx.send(WatchCommand::Shutdown).await?;
    handle.await?;

    tracing::info!("Demo finished, last UID {}", tracker.last_uid());
    Ok(())
}

/// Appending is where a durable counter can lose a race; retrying is the
/// caller's call, bounded here.
async fn append_with_retry(mailbox: &MemoryMailbox, flags: FlagSet) -> CoreResult<Uid> {
    let mut attempt = 1;
    loop {
        match mailbox.append(flags.clone()).await {
            Err(e) if e.is_conflict() && attempt < APPEND_ATTEMPTS => {
                tracing::warn!("Append attempt {} conflicted: {}", attempt, e);
                attempt += 1;
            }
            result => return result,
        }
    }
}

async fn step(
    title: &str,
    cmd_tx: &mpsc::Sender<WatchCommand>,
    evt_rx: &mut mpsc::Receiver<WatchEvent>,
    alice_rx: &mut mpsc::UnboundedReceiver<UnsolicitedResponse>,
    bob_rx: &mut mpsc::UnboundedReceiver<UnsolicitedResponse>,
) -> anyhow::Result<()> {
    println!("== {}", title);
    cmd_tx.send(WatchCommand::PollAll).await?;

    // An interval tick may already have reconciled these changes, in which
    // case the requested poll finds nothing and reports nothing.
    match tokio::time::timeout(POLL_WAIT, evt_rx.recv()).await {
        Ok(Some(WatchEvent::PollFailed { error, .. })) => anyhow::bail!("poll failed: {}", error),
        Ok(Some(event)) => tracing::debug!("{:?}", event),
        Ok(None) => anyhow::bail!("watcher stopped unexpectedly"),
        Err(_) => tracing::debug!("No changes reported within {:?}", POLL_WAIT),
    }

    for (name, rx) in [("alice", alice_rx), ("bob", bob_rx)] {
        while let Ok(response) = rx.try_recv() {
            println!("[{}] {}", name, response);
        }
    }
    Ok(())
}
