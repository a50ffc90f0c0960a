use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the content-addressed shared memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    /// Soft cap on total bytes held in the store. Reaching it rejects new
    /// `store` calls until the eviction sweep or an explicit `unpin` frees
    /// room.
    #[serde(default = "d_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Entries whose serialized size is at or above this threshold are
    /// compressed before being written.
    #[serde(default = "d_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,
    /// TTL applied to an entry when the caller doesn't supply one.
    #[serde(default = "d_default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Interval between eviction sweeps of expired, unpinned entries.
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: d_max_memory_bytes(),
            compression_threshold_bytes: d_compression_threshold_bytes(),
            default_ttl_secs: d_default_ttl_secs(),
            sweep_interval_secs: d_sweep_interval_secs(),
        }
    }
}

fn d_max_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

fn d_compression_threshold_bytes() -> usize {
    8 * 1024
}

fn d_default_ttl_secs() -> u64 {
    3600
}

fn d_sweep_interval_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_compression_threshold_is_smaller_than_max_memory() {
        let cfg = SharedMemoryConfig::default();
        assert!((cfg.compression_threshold_bytes as u64) < cfg.max_memory_bytes);
    }
}
