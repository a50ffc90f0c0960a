use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A content-addressed entry held by the [`crate::store::SharedMemoryStore`].
///
/// `bytes` is the on-disk (possibly gzip-compressed) representation;
/// `compressed` records whether it needs inflating on read.
#[derive(Debug, Clone)]
pub struct StoredReference {
    pub id: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub size: usize,
    pub stored_at: DateTime<Utc>,
    pub ttl: std::time::Duration,
    pub refcount: u32,
    pub compressed: bool,
}

impl StoredReference {
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        if self.refcount != 0 {
            return false;
        }
        let elapsed_ms = now
            .signed_duration_since(self.stored_at)
            .num_milliseconds()
            .max(0) as u64;
        elapsed_ms > self.ttl.as_millis() as u64
    }
}

/// Aggregate counters returned by [`crate::store::SharedMemoryStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub pinned_bytes: usize,
}
