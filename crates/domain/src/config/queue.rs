use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the persistent per-recipient message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "d_pool_size")]
    pub pool_size: u32,
    /// How long a dequeued-but-unacknowledged message stays invisible to
    /// other consumers before it's treated as abandoned and redelivered.
    #[serde(default = "d_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Retry budget applied when a message carries no explicit `max_retries`.
    #[serde(default = "d_default_max_retries")]
    pub default_max_retries: u32,
    /// Interval between sweeps that requeue messages past their visibility
    /// timeout and dead-letter messages that exhausted retries.
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
            pool_size: d_pool_size(),
            visibility_timeout_secs: d_visibility_timeout_secs(),
            default_max_retries: d_default_max_retries(),
            sweep_interval_secs: d_sweep_interval_secs(),
        }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("./data/queue.db")
}

fn d_pool_size() -> u32 {
    8
}

fn d_visibility_timeout_secs() -> u64 {
    30
}

fn d_default_max_retries() -> u32 {
    3
}

fn d_sweep_interval_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_visibility_timeout_exceeds_sweep_interval() {
        let cfg = QueueConfig::default();
        assert!(cfg.visibility_timeout_secs > cfg.sweep_interval_secs);
    }
}
