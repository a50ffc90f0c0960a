//! Communication Policy (spec §4.7): pure, stateless functions over
//! `sa_domain::config::CommunicationPolicyConfig`. Never touches the
//! queue, the shared memory store, or any other component — a rule table
//! lookup only.

use sa_domain::config::CommunicationPolicyConfig;
use sa_protocol::DeliveryPolicy;

/// Thin wrapper over the loaded config; holds no state of its own beyond
/// the rule table, matching spec §4.7's "pure, stateless" requirement.
pub struct CommunicationPolicy {
    config: CommunicationPolicyConfig,
}

impl CommunicationPolicy {
    pub fn new(config: CommunicationPolicyConfig) -> Self {
        Self { config }
    }

    /// `size > threshold(type)`, per spec §4.7.
    pub fn should_use_reference(&self, message_type: &str, size: usize) -> bool {
        size > self.config.rule_for(message_type).inline_threshold_bytes
    }

    /// The delivery policy struct the queue layer consults for a given
    /// message type.
    pub fn get_policy(&self, message_type: &str) -> DeliveryPolicy {
        DeliveryPolicy::from(self.config.rule_for(message_type))
    }
}
