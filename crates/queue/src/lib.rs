//! Persistent, per-recipient message queue with priority, TTL, retries,
//! acknowledge/nack, and RPC correlation (spec §4.5).

pub mod message;
pub mod queue;

pub use message::{QueueMessage, QueueStatus};
pub use queue::MessageQueue;
