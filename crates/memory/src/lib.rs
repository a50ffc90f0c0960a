//! `sa-memory` — process-resident Memory façade over the Session Store
//! (spec §4.4): caches session handles, serialises per-session appends,
//! and fans out observer notifications off a dedicated dispatch task so
//! `add_message` callers never block on a slow observer.

pub mod handle;
pub mod memory;

pub use handle::SessionHandle;
pub use memory::{Memory, ObserverFn};
