//! Address book configuration (TOML-serializable).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default capacity of each subscriber's outbound channel.
pub const DEFAULT_STREAM_CHANNEL_CAPACITY: usize = 16;

/// Default interval between background sweeps of expired records.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrBookError {
    #[error("invalid address book config: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrBookConfig {
    /// Addresses handed to a stream consumer ahead of it polling.
    ///
    /// Anything beyond this is held in the subscriber's own unbounded buffer,
    /// so this never limits how much a subscriber can queue.
    #[serde(default = "default_stream_channel_capacity")]
    pub stream_channel_capacity: usize,

    /// Seconds between sweeps when the background collector is running.
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

fn default_stream_channel_capacity() -> usize {
    DEFAULT_STREAM_CHANNEL_CAPACITY
}

fn default_gc_interval_secs() -> u64 {
    DEFAULT_GC_INTERVAL_SECS
}

impl Default for AddrBookConfig {
    fn default() -> Self {
        Self {
            stream_channel_capacity: DEFAULT_STREAM_CHANNEL_CAPACITY,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
        }
    }
}

impl AddrBookConfig {
    pub fn validate(&self) -> Result<(), AddrBookError> {
        if self.stream_channel_capacity == 0 {
            return Err(AddrBookError::InvalidConfig(
                "stream_channel_capacity must be non-zero",
            ));
        }
        if self.gc_interval_secs == 0 {
            return Err(AddrBookError::InvalidConfig(
                "gc_interval_secs must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}
