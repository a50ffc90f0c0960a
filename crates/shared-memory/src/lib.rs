//! Content-addressed shared memory store and its reference tracker
//! (spec §4.1–§4.2): large payloads pinned to the sessions that need them,
//! evicted once unpinned and past TTL.

pub mod entry;
pub mod reference_tracker;
pub mod store;

pub use entry::{StoreStats, StoredReference};
pub use reference_tracker::{ReferenceTracker, TrackerStats};
pub use store::SharedMemoryStore;
