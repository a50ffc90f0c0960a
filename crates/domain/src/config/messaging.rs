use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Communication policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Delivery mode requested for a message type. `Async` fires and forgets
/// onto the queue, `Ack` blocks the sender until the recipient acknowledges
/// receipt, `Rpc` blocks until a correlated reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Async,
    Ack,
    Rpc,
}

/// Per-message-type rule consulted by `ShouldUseReference`/`GetPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTypeRule {
    /// Payloads at or above this size are stored by reference instead of
    /// travelling inline in the envelope.
    #[serde(default = "d_inline_threshold_bytes")]
    pub inline_threshold_bytes: usize,
    #[serde(default = "d_delivery")]
    pub delivery: DeliveryMode,
    #[serde(default = "d_priority")]
    pub priority: u8,
}

impl Default for MessageTypeRule {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: d_inline_threshold_bytes(),
            delivery: d_delivery(),
            priority: d_priority(),
        }
    }
}

/// Configuration for the communication policy: a default rule plus
/// per-message-type overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationPolicyConfig {
    #[serde(default)]
    pub default_rule: MessageTypeRule,
    #[serde(default)]
    pub rules: HashMap<String, MessageTypeRule>,
}

impl Default for CommunicationPolicyConfig {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            "tool_result".to_string(),
            MessageTypeRule {
                inline_threshold_bytes: 4 * 1024,
                delivery: DeliveryMode::Async,
                priority: 5,
            },
        );
        rules.insert(
            "session_state".to_string(),
            MessageTypeRule {
                inline_threshold_bytes: 1024,
                delivery: DeliveryMode::Ack,
                priority: 7,
            },
        );
        rules.insert(
            "pattern_data".to_string(),
            MessageTypeRule {
                inline_threshold_bytes: 2 * 1024,
                delivery: DeliveryMode::Async,
                priority: 3,
            },
        );
        Self {
            default_rule: MessageTypeRule::default(),
            rules,
        }
    }
}

impl CommunicationPolicyConfig {
    pub fn rule_for(&self, message_type: &str) -> &MessageTypeRule {
        self.rules.get(message_type).unwrap_or(&self.default_rule)
    }
}

fn d_inline_threshold_bytes() -> usize {
    16 * 1024
}

fn d_delivery() -> DeliveryMode {
    DeliveryMode::Async
}

fn d_priority() -> u8 {
    5
}
