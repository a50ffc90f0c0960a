//! Wire envelope for inter-agent communication (spec §6): the
//! `CommunicationMessage` that travels between the Agent Messaging Layer
//! and the Message Queue, and the delivery policy attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sa_domain::config::{DeliveryMode, MessageTypeRule};
use sa_domain::model::Payload;

/// Envelope exchanged between agents: `{id, from_agent, to_agent, payload,
/// policy, timestamp}` per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationMessage {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub payload: Payload,
    pub policy: DeliveryPolicy,
    pub timestamp: DateTime<Utc>,
    /// Present on RPC requests/responses: the id this message is a reply
    /// to, used to correlate `SendAndReceive` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl CommunicationMessage {
    pub fn new(
        id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: impl Into<String>,
        payload: Payload,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message_type: message_type.into(),
            payload,
            policy,
            timestamp: Utc::now(),
            in_reply_to: None,
        }
    }

    pub fn as_reply_to(mut self, in_reply_to: impl Into<String>) -> Self {
        self.in_reply_to = Some(in_reply_to.into());
        self
    }
}

/// Delivery policy carried alongside a message, as returned by
/// `CommunicationPolicy::get_policy` (spec §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub delivery: DeliveryMode,
    pub priority: u8,
}

impl From<&MessageTypeRule> for DeliveryPolicy {
    fn from(rule: &MessageTypeRule) -> Self {
        Self {
            delivery: rule.delivery,
            priority: rule.priority,
        }
    }
}
