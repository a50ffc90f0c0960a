use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sa_domain::model::Payload;

/// Lifecycle state of a [`QueueMessage`] (spec §3/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Acked,
    Dead,
}

/// A durable, per-recipient queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub payload: Payload,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    #[serde(default)]
    pub attempt: u32,
    pub status: QueueStatus,
    /// Set on a response message to correlate it back to the request that
    /// produced it (spec §4.5 `SendAndReceive`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}
