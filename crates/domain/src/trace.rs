use serde::Serialize;

/// Structured trace events emitted across all SerialAgent core crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SharedMemoryStored {
        reference_id: String,
        size_bytes: usize,
        compressed: bool,
        ttl_secs: Option<u64>,
    },
    SharedMemoryEvicted {
        reference_id: String,
        reason: String,
    },
    SharedMemoryPinned {
        reference_id: String,
        session_id: String,
        ref_count: u32,
    },
    SharedMemoryUnpinned {
        reference_id: String,
        session_id: String,
        ref_count: u32,
    },
    SessionCreated {
        session_id: String,
        agent_id: String,
        parent_session_id: Option<String>,
    },
    SessionDeleted {
        session_id: String,
    },
    MessageAppended {
        session_id: String,
        message_id: i64,
        role: String,
    },
    QueueEnqueued {
        message_id: String,
        recipient: String,
        priority: u8,
    },
    QueueDequeued {
        message_id: String,
        recipient: String,
        attempt: u32,
    },
    QueueAcked {
        message_id: String,
    },
    QueueNacked {
        message_id: String,
        retry_count: u32,
        dead_lettered: bool,
    },
    QueueRedelivered {
        message_id: String,
        reason: String,
    },
    MessageSent {
        message_id: String,
        sender: String,
        recipient: String,
        message_type: String,
        inline: bool,
        duration_ms: u64,
    },
    MessageDelivered {
        message_id: String,
        recipient: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sa_event");
    }
}
