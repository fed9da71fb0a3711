// bluetrace-config/src/tailer.rs
//! Incremental tailing parameters for the packet-dump output file.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Tailer configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct TailerConfig {
    /// Sleep between polls when no new bytes were found (milliseconds).
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long to wait for the output file to appear (milliseconds).
    #[validate(range(min = 1, max = 120000))]
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout_ms: u64,

    /// First retry delay while waiting for the output file (milliseconds).
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_backoff_initial")]
    pub attach_backoff_initial_ms: u64,

    /// Upper bound of the retry delay (milliseconds).
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_backoff_max")]
    pub attach_backoff_max_ms: u64,

    /// Largest chunk read and published by a single poll.
    #[validate(range(min = 512, max = 16777216))]
    #[serde(default = "default_read_chunk")]
    pub read_chunk_bytes: usize,

    /// Bytes retained for replay to late subscribers.
    #[validate(range(min = 1024, max = 1073741824))]
    #[serde(default = "default_replay_limit")]
    pub replay_limit_bytes: usize,
}

fn default_poll_interval() -> u64 {
    200
}

fn default_attach_timeout() -> u64 {
    5000
}

fn default_backoff_initial() -> u64 {
    25
}

fn default_backoff_max() -> u64 {
    500
}

fn default_read_chunk() -> usize {
    65536
}

fn default_replay_limit() -> usize {
    8 * 1024 * 1024
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            attach_timeout_ms: default_attach_timeout(),
            attach_backoff_initial_ms: default_backoff_initial(),
            attach_backoff_max_ms: default_backoff_max(),
            read_chunk_bytes: default_read_chunk(),
            replay_limit_bytes: default_replay_limit(),
        }
    }
}

/// Redundant file-change notifier settings.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct WatchConfig {
    /// Install a file-change watcher on the session directory.
    #[serde(default = "default_watch_enabled")]
    pub enabled: bool,
}

fn default_watch_enabled() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_watch_enabled(),
        }
    }
}
