//! Watcher configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uidtrack_core::{CoreError, CoreResult};

/// Mailbox watcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Poll the whole mailbox this often; `None` polls only on command
    pub poll_interval_ms: Option<u64>,
    /// Capacity of the command channel
    pub command_buffer: usize,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            command_buffer: 32,
            event_buffer: 100,
        }
    }
}

impl WatcherConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.poll_interval_ms == Some(0) {
            return Err(CoreError::Config("poll_interval_ms must be positive".into()));
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(CoreError::Config("channel buffers must be positive".into()));
        }
        Ok(())
    }
}
