//! Session-side plumbing for uidtrack
//!
//! Turns tracker notifications into per-session unsolicited responses and
//! runs the background task that keeps a tracker in step with its mailbox.

mod config;
mod notifier;
mod watcher;

pub use config::WatcherConfig;
pub use notifier::{SessionNotifier, UnsolicitedResponse};
pub use watcher::{create_watch_channels, MailboxWatcher, WatchCommand, WatchEvent};
