//! Maps `session_id -> set<reference_id>` and routes session deletion into
//! bulk unpin (spec §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use sa_domain::trace::TraceEvent;

use crate::store::SharedMemoryStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub session_count: usize,
    pub total_refs: usize,
}

/// Stateful collaborator over [`SharedMemoryStore`]. A single mutex guards
/// the session -> refs map (spec §5's "Reference Tracker uses a single
/// mutex").
pub struct ReferenceTracker {
    store: Arc<SharedMemoryStore>,
    sessions: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReferenceTracker {
    pub fn new(store: Arc<SharedMemoryStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `ref_id` to the session's set and pins it in the store iff the
    /// add was new — idempotent per session.
    pub fn pin_for_session(&self, session_id: &str, ref_id: &str) -> sa_domain::error::Result<()> {
        let mut sessions = self.sessions.lock();
        let refs = sessions.entry(session_id.to_string()).or_default();
        let is_new = refs.insert(ref_id.to_string());
        drop(sessions);

        if is_new {
            self.store.pin(ref_id)?;
            TraceEvent::SharedMemoryPinned {
                reference_id: ref_id.to_string(),
                session_id: session_id.to_string(),
                ref_count: self.store.stats().entries as u32,
            }
            .emit();
        }
        Ok(())
    }

    /// Atomically removes the session's ref set and unpins each id it held.
    pub fn unpin_session(&self, session_id: &str) {
        let refs = {
            let mut sessions = self.sessions.lock();
            sessions.remove(session_id)
        };
        let Some(refs) = refs else { return };
        for ref_id in refs {
            let remaining = self.store.unpin(&ref_id);
            TraceEvent::SharedMemoryUnpinned {
                reference_id: ref_id,
                session_id: session_id.to_string(),
                ref_count: remaining,
            }
            .emit();
        }
    }

    pub fn get_session_references(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|refs| refs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TrackerStats {
        let sessions = self.sessions.lock();
        TrackerStats {
            session_count: sessions.len(),
            total_refs: sessions.values().map(|refs| refs.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::SharedMemoryConfig;
    use std::collections::HashMap as StdHashMap;

    fn tracker() -> (ReferenceTracker, Arc<SharedMemoryStore>) {
        let store = SharedMemoryStore::new(SharedMemoryConfig::default());
        store
            .store("ref_A", b"payload", None, StdHashMap::new(), None)
            .unwrap();
        (ReferenceTracker::new(Arc::clone(&store)), store)
    }

    #[test]
    fn pin_for_session_is_idempotent() {
        let (tracker, store) = tracker();
        tracker.pin_for_session("s1", "ref_A").unwrap();
        tracker.pin_for_session("s1", "ref_A").unwrap();
        assert_eq!(store.stats().pinned_bytes, b"payload".len());
        assert_eq!(tracker.get_session_references("s1"), vec!["ref_A".to_string()]);
    }

    #[test]
    fn unpin_session_clears_references_and_unpins_store() {
        let (tracker, store) = tracker();
        tracker.pin_for_session("s1", "ref_A").unwrap();
        tracker.unpin_session("s1");
        assert!(tracker.get_session_references("s1").is_empty());
        assert_eq!(store.stats().pinned_bytes, 0);
    }

    #[test]
    fn pin_count_conservation() {
        let (tracker, _store) = tracker();
        tracker.pin_for_session("s1", "ref_A").unwrap();
        tracker.pin_for_session("s2", "ref_A").unwrap();
        let stats = tracker.stats();
        assert_eq!(stats.total_refs, 2);
        assert_eq!(stats.session_count, 2);
    }
}
