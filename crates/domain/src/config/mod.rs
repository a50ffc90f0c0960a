//! Static configuration for the SerialAgent core runtime: the session
//! store, shared memory store, message queue, communication policy, and
//! observability exporter. Loaded once at startup (see
//! [`Config::from_toml_str`]) and handed to each component as an `Arc`.

mod messaging;
mod observability;
mod queue;
mod sessions;
mod shared_memory;

pub use messaging::{CommunicationPolicyConfig, DeliveryMode, MessageTypeRule};
pub use observability::ObservabilityConfig;
pub use queue::QueueConfig;
pub use sessions::SessionStoreConfig;
pub use shared_memory::SharedMemoryConfig;

use serde::{Deserialize, Serialize};

/// Top-level configuration aggregating every component's settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionStoreConfig,
    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub messaging: CommunicationPolicyConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            severity: ConfigSeverity::Fatal,
            message: format!("failed to parse config: {e}"),
        })
    }

    /// Sanity-check cross-field invariants that serde defaults alone can't
    /// enforce. Returns every issue found rather than bailing on the first.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.shared_memory.compression_threshold_bytes as u64 > self.shared_memory.max_memory_bytes {
            issues.push(ConfigError {
                severity: ConfigSeverity::Fatal,
                message: "shared_memory.compression_threshold_bytes exceeds max_memory_bytes".into(),
            });
        }
        if self.shared_memory.max_memory_bytes == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Fatal,
                message: "shared_memory.max_memory_bytes must be greater than zero".into(),
            });
        }

        if self.queue.visibility_timeout_secs == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Fatal,
                message: "queue.visibility_timeout_secs must be greater than zero".into(),
            });
        }
        if self.queue.sweep_interval_secs > self.queue.visibility_timeout_secs {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                message: "queue.sweep_interval_secs exceeds visibility_timeout_secs; abandoned messages will sit invisible longer than intended".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            issues.push(ConfigError {
                severity: ConfigSeverity::Fatal,
                message: "observability.sample_rate must be between 0.0 and 1.0".into(),
            });
        }

        for (message_type, rule) in &self.messaging.rules {
            if rule.priority > 9 {
                issues.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "messaging.rules[{message_type}].priority {} exceeds the conventional 0-9 range",
                        rule.priority
                    ),
                });
            }
        }

        issues
    }
}

/// Severity of a configuration issue found by [`Config::validate`].
/// `Warning`s are logged and otherwise ignored; `Fatal` issues should
/// prevent startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}
