//! Durable session and message storage (spec §4.3): sessions, messages,
//! and the parent/child session graph, backed by `rusqlite` under WAL
//! journaling.

pub mod store;

pub use store::SessionStore;
