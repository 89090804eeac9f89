use serde::{Deserialize, Serialize};

/// Chat interaction logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ChatLogConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Keyword-based content policy applied to request text before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentPolicyConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Terms matched case-insensitively as literal substrings.
    #[serde(default)]
    pub words: Vec<String>,
}

/// Background job queue used for hold releases and chat log writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobQueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: default_workers(),
        }
    }
}

/// Batching for consume log writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageBufferConfig {
    /// Maximum entries per flush.
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Entries beyond this many pending are dropped.
    #[serde(default = "default_max_pending")]
    pub max_pending_entries: usize,
}

impl Default for UsageBufferConfig {
    fn default() -> Self {
        Self {
            max_size: default_buffer_max_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_pending_entries: default_max_pending(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_workers() -> usize {
    2
}

fn default_buffer_max_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_pending() -> usize {
    10_000
}
