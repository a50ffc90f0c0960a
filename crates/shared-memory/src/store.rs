//! Content-addressed store of large payloads with TTL, compression-above-
//! threshold, and explicit pin/unpin reference counting (spec §4.1).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use sa_domain::config::SharedMemoryConfig;
use sa_domain::error::{Error, Result};
use sa_domain::trace::TraceEvent;

use crate::entry::{StoreStats, StoredReference};

/// Process-wide content-addressed store. Construct exactly one instance
/// per process and share it via `Arc` — re-acquiring with a different
/// configuration is not supported; the first construction wins (spec §9).
pub struct SharedMemoryStore {
    config: SharedMemoryConfig,
    entries: Mutex<HashMap<String, StoredReference>>,
}

impl SharedMemoryStore {
    pub fn new(config: SharedMemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background eviction sweep. Runs until `cancel` fires.
    pub fn spawn_eviction_task(self: &Arc<Self>, cancel: CancellationToken) {
        let store = Arc::clone(self);
        let interval = Duration::from_secs(store.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Insert or atomically replace the entry identified by `id`. Does not
    /// change refcount on replace.
    pub fn store(
        &self,
        id: &str,
        bytes: &[u8],
        content_type: Option<String>,
        metadata: HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> Result<StoredReference> {
        let size = bytes.len();
        let (stored_bytes, compressed) = if size > self.config.compression_threshold_bytes {
            (gzip(bytes)?, true)
        } else {
            (bytes.to_vec(), false)
        };

        let ttl = ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs));
        let mut entries = self.entries.lock();

        let refcount = entries.get(id).map(|e| e.refcount).unwrap_or(0);
        let candidate = StoredReference {
            id: id.to_string(),
            bytes: stored_bytes,
            content_type,
            metadata,
            size,
            stored_at: Utc::now(),
            ttl,
            refcount,
            compressed,
        };

        let previous = entries.remove(id);
        let total_after: usize = entries.values().map(|e| e.bytes.len()).sum::<usize>()
            + candidate.bytes.len();

        if total_after as u64 > self.config.max_memory_bytes {
            evict_expired_locked(&mut entries, Some(id));
            let total_after: usize =
                entries.values().map(|e| e.bytes.len()).sum::<usize>() + candidate.bytes.len();
            if total_after as u64 > self.config.max_memory_bytes {
                if let Some(previous) = previous {
                    entries.insert(id.to_string(), previous);
                }
                return Err(Error::CapacityExceeded(format!(
                    "storing {size} bytes for {id} would exceed max_memory_bytes={}",
                    self.config.max_memory_bytes
                )));
            }
        }

        entries.insert(id.to_string(), candidate.clone());
        drop(entries);

        TraceEvent::SharedMemoryStored {
            reference_id: id.to_string(),
            size_bytes: size,
            compressed,
            ttl_secs: Some(ttl.as_secs()),
        }
        .emit();

        Ok(candidate)
    }

    /// Fetch and transparently decompress the bytes for `id`. Does not
    /// touch refcount.
    pub fn get(&self, id: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock();
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("shared memory entry {id}")))?;
        if entry.compressed {
            gunzip(&entry.bytes)
        } else {
            Ok(entry.bytes.clone())
        }
    }

    /// Increment the refcount for `id`.
    pub fn pin(&self, id: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("shared memory entry {id}")))?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Decrement the refcount for `id`. A no-op, not an error, when the
    /// entry is missing or already at zero refcount.
    pub fn unpin(&self, id: &str) -> u32 {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.refcount > 0 => {
                entry.refcount -= 1;
                entry.refcount
            }
            Some(entry) => entry.refcount,
            None => 0,
        }
    }

    pub fn stats(&self) -> StoreStats {
        let entries = self.entries.lock();
        let mut stats = StoreStats::default();
        stats.entries = entries.len();
        for entry in entries.values() {
            stats.total_bytes += entry.bytes.len();
            if entry.refcount > 0 {
                stats.pinned_bytes += entry.bytes.len();
            }
        }
        stats
    }

    /// Run the eviction sweep outside the background task (used directly by
    /// tests and by a forced sweep on `store`).
    pub fn sweep_expired(&self) {
        let mut entries = self.entries.lock();
        let evicted = evict_expired_locked(&mut entries, None);
        drop(entries);
        for id in evicted {
            TraceEvent::SharedMemoryEvicted {
                reference_id: id,
                reason: "ttl expired, refcount zero".to_string(),
            }
            .emit();
        }
    }
}

/// Evict zero-refcount, TTL-expired entries oldest-first, skipping `exclude`.
/// Returns the ids evicted.
fn evict_expired_locked(
    entries: &mut HashMap<String, StoredReference>,
    exclude: Option<&str>,
) -> Vec<String> {
    let now = Utc::now();
    let mut candidates: Vec<(String, chrono::DateTime<Utc>)> = entries
        .values()
        .filter(|e| Some(e.id.as_str()) != exclude && e.is_evictable(now))
        .map(|e| (e.id.clone(), e.stored_at))
        .collect();
    candidates.sort_by_key(|(_, stored_at)| *stored_at);

    let mut evicted = Vec::new();
    for (id, _) in candidates {
        entries.remove(&id);
        evicted.push(id);
    }
    evicted
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| Error::persistence("compressing shared memory entry", e))?;
    encoder
        .finish()
        .map_err(|e| Error::persistence("finalizing compressed shared memory entry", e))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::persistence("decompressing shared memory entry", e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SharedMemoryConfig {
        SharedMemoryConfig {
            max_memory_bytes: 10 * 1024 * 1024,
            compression_threshold_bytes: 1024,
            default_ttl_secs: 60,
            sweep_interval_secs: 1,
        }
    }

    #[test]
    fn store_then_get_roundtrips_small_payload() {
        let store = SharedMemoryStore::new(test_config());
        store
            .store("a", b"hello", None, HashMap::new(), None)
            .unwrap();
        assert_eq!(store.get("a").unwrap(), b"hello");
    }

    #[test]
    fn large_payload_is_compressed_and_roundtrips() {
        let store = SharedMemoryStore::new(test_config());
        let payload = vec![b'x'; 15 * 1024];
        let entry = store
            .store("ref_A", &payload, None, HashMap::new(), None)
            .unwrap();
        assert!(entry.compressed);
        assert_eq!(store.get("ref_A").unwrap(), payload);
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = SharedMemoryStore::new(test_config());
        assert!(matches!(store.get("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn pin_unpin_tracks_refcount_and_unpin_on_zero_is_noop() {
        let store = SharedMemoryStore::new(test_config());
        store.store("a", b"x", None, HashMap::new(), None).unwrap();
        assert_eq!(store.pin("a").unwrap(), 1);
        assert_eq!(store.unpin("a"), 0);
        assert_eq!(store.unpin("a"), 0);
    }

    #[test]
    fn store_does_not_reset_refcount_on_replace() {
        let store = SharedMemoryStore::new(test_config());
        store.store("a", b"v1", None, HashMap::new(), None).unwrap();
        store.pin("a").unwrap();
        store
            .store("a", b"v2-longer", None, HashMap::new(), None)
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.pinned_bytes, b"v2-longer".len());
    }

    #[test]
    fn capacity_exceeded_when_nothing_evictable() {
        let config = SharedMemoryConfig {
            max_memory_bytes: 10,
            compression_threshold_bytes: 1024,
            default_ttl_secs: 3600,
            sweep_interval_secs: 60,
        };
        let store = SharedMemoryStore::new(config);
        store.store("a", b"1234567890", None, HashMap::new(), None).unwrap();
        store.pin("a").unwrap();
        let result = store.store("b", b"overflow!!", None, HashMap::new(), None);
        assert!(matches!(result, Err(Error::CapacityExceeded(_))));
    }

    #[test]
    fn sweep_evicts_expired_zero_refcount_entries() {
        let config = SharedMemoryConfig {
            max_memory_bytes: 10 * 1024 * 1024,
            compression_threshold_bytes: 1024,
            default_ttl_secs: 0,
            sweep_interval_secs: 1,
        };
        let store = SharedMemoryStore::new(config);
        store.store("a", b"x", None, HashMap::new(), Some(Duration::from_secs(0))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.sweep_expired();
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn pinned_entries_survive_sweep_even_past_ttl() {
        let config = SharedMemoryConfig {
            max_memory_bytes: 10 * 1024 * 1024,
            compression_threshold_bytes: 1024,
            default_ttl_secs: 0,
            sweep_interval_secs: 1,
        };
        let store = SharedMemoryStore::new(config);
        store.store("a", b"x", None, HashMap::new(), Some(Duration::from_secs(0))).unwrap();
        store.pin("a").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.sweep_expired();
        assert_eq!(store.stats().entries, 1);
    }
}
