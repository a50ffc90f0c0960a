//! Core data model shared by the session store, memory façade, shared
//! memory store, and messaging layer: sessions, messages, tool calls, and
//! the reference/payload types that travel between agents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A durable conversational context owned by one agent.
///
/// `parent_session_id` is either empty or refers to an existing session at
/// creation time; circular parenthood is rejected by the session store
/// before the row is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub totals: SessionTotals,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            parent_session_id: None,
            created_at: now,
            updated_at: now,
            totals: SessionTotals::default(),
            context: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }
}

/// Running token/cost totals for a session. Monotonic: only ever
/// incremented by `record_usage`, reset solely by session deletion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionTotals {
    pub tokens: u64,
    pub cost: f64,
}

impl SessionTotals {
    pub fn record_usage(&mut self, tokens: u64, cost: f64) {
        self.tokens += tokens;
        self.cost += cost;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A role a message was authored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// Visibility of a message across the parent/child session graph.
///
/// `Coordinator` and `Shared` messages are inherited by descendant
/// sessions; `Direct` messages never cross a session boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionContext {
    Coordinator,
    Direct,
    Shared,
}

impl SessionContext {
    /// Whether a message carrying this context is visible to a descendant
    /// session reading its parent's history.
    pub fn crosses_session_boundary(self) -> bool {
        matches!(self, SessionContext::Coordinator | SessionContext::Shared)
    }
}

/// Opaque-to-the-core record of a tool invocation attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: HashMap<String, serde_json::Value>,
}

/// An append-only record within a session.
///
/// `id` is a monotonic ordinal assigned by the session store at append
/// time; it is the documented tie-breaker when two messages share a
/// `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub session_context: SessionContext,
}

impl Message {
    /// Construct a message ready for append; `id` is assigned by the store.
    pub fn new(
        session_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        session_context: SessionContext,
    ) -> Self {
        Self {
            id: 0,
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count: 0,
            cost: 0.0,
            tool_calls: Vec::new(),
            session_context,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload / reference
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata carried alongside a `Payload`, regardless of variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PayloadMetadata {
    pub size_bytes: usize,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// A tag classifying what a reference points to. Advisory only — it never
/// changes resolution semantics, just gives operators a hint when
/// inspecting the shared memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    SessionState,
    ToolResult,
    PatternData,
    LargePayload,
}

impl ReferenceType {
    /// Closed mapping from a message type string to its reference-type tag,
    /// with `LargePayload` as the default for anything unrecognized.
    pub fn infer(message_type: &str) -> Self {
        match message_type {
            "session_state" => ReferenceType::SessionState,
            "tool_result" => ReferenceType::ToolResult,
            "pattern_data" => ReferenceType::PatternData,
            _ => ReferenceType::LargePayload,
        }
    }
}

/// A resolvable pointer into the shared memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferencePointer {
    pub id: String,
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
    /// Free-form hint about where/how the reference is stored, surfaced to
    /// operators; never interpreted by the core.
    #[serde(default)]
    pub storage_hint: Option<String>,
}

/// Message payload: either the bytes travel inline in the envelope, or an
/// identifier resolves them via the shared memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Inline {
        bytes: Vec<u8>,
        metadata: PayloadMetadata,
    },
    Reference {
        reference: ReferencePointer,
        metadata: PayloadMetadata,
    },
}

impl Payload {
    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Inline { metadata, .. } => metadata.size_bytes,
            Payload::Reference { metadata, .. } => metadata.size_bytes,
        }
    }
}
