use serde::Deserialize;

use crate::storage::Metadata;

/// Service configuration. Every section has sensible defaults; deployments
/// override only what they need.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub notification: NotificationConfig,
    pub queue_defaults: QueueDefaults,
    pub topic_defaults: TopicDefaults,
    pub redis: RedisConfig,
}

/// Tuning for the notification dispatcher and its retry engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Retry budget for the EXPONENTIAL_DECAY_RETRY push policy.
    pub max_notifier_retries: u32,
    /// Upper bound on concurrently delivering subscriptions.
    pub workers: usize,
    /// Per-request timeout for webhook POSTs, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_notifier_retries: 10,
            workers: 10,
            request_timeout_secs: 30,
        }
    }
}

/// Defaults applied when queue metadata leaves a knob unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    pub default_message_ttl: u64,
    pub delay_ttl: u64,
    pub claim_ttl: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            default_message_ttl: 3600,
            delay_ttl: 0,
            claim_ttl: 1,
        }
    }
}

/// Defaults backing the reserved (`_`-prefixed) topic metadata keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicDefaults {
    pub max_messages_post_size: u64,
    pub default_message_ttl: u64,
}

impl Default for TopicDefaults {
    fn default() -> Self {
        Self {
            max_messages_post_size: 262_144,
            default_message_ttl: 3600,
        }
    }
}

impl TopicDefaults {
    /// The reserved metadata keys, fully populated from this config.
    /// Reserved keys are always present on a topic and survive removal.
    pub fn reserved_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert(
            "_max_messages_post_size".to_string(),
            serde_json::json!(self.max_messages_post_size),
        );
        meta.insert(
            "_default_message_ttl".to_string(),
            serde_json::json!(self.default_message_ttl),
        );
        meta
    }
}

/// Connection options for the Redis storage driver.
///
/// The URI takes one of three forms: `redis://host[:port][?options]` for a
/// direct connection, a comma-separated sentinel list with `master=<name>`
/// in the query string for an HA cluster, or `redis:/path/to/redis.sock`
/// for a unix socket. Recognized here so deployments validate against one
/// schema; the in-memory reference driver ignores it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub uri: String,
    /// Retries for an operation interrupted by a node failover.
    pub max_reconnect_attempts: u32,
    /// Base sleep between reconnect attempts, in seconds.
    pub reconnect_sleep: f64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            uri: "redis://127.0.0.1:6379".to_string(),
            max_reconnect_attempts: 10,
            reconnect_sleep: 1.0,
        }
    }
}
