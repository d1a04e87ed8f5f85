//! Storage seams consumed by the core.
//!
//! The queue/message/claim controllers are external collaborators: the core
//! only speaks these traits, and a production driver implements them. The
//! topic/monitor/subscription stores are the persistence seams of the
//! controllers this crate owns. [`memory::MemoryDriver`] implements every
//! trait and is the reference driver for tests and embedded use.
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::message::{ClaimedMessage, Message};
use crate::monitor::{MonitorType, StoredMonitor};
use crate::subscription::Subscription;
use crate::topic::StoredTopic;

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("queue {0} does not exist")]
    QueueDoesNotExist(String),

    #[error("topic {0} does not exist")]
    TopicDoesNotExist(String),

    #[error("subscription {0} does not exist")]
    SubscriptionDoesNotExist(String),

    #[error("monitor {0} does not exist")]
    MonitorDoesNotExist(String),

    #[error("monitor {0} already exists")]
    MonitorAlreadyExist(String),

    #[error("claim for message handle {0} has expired")]
    MessageClaimedExpired(String),

    #[error("message handle {0} is invalid")]
    MessageHandleInvalid(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// HTTP-equivalent status for transport layers. Paths with their own
    /// mapping rules (consume, patch, publish) override this on their
    /// error types.
    pub fn status(&self) -> u16 {
        match self {
            Self::QueueDoesNotExist(_)
            | Self::TopicDoesNotExist(_)
            | Self::SubscriptionDoesNotExist(_)
            | Self::MonitorDoesNotExist(_)
            | Self::MessageHandleInvalid(_) => 404,
            Self::MonitorAlreadyExist(_) | Self::MessageClaimedExpired(_) => 409,
            Self::Unavailable(_) => 503,
        }
    }
}

/// Claim parameters. Grace is carried for drivers that support it; the
/// consume path always passes zero.
#[derive(Debug, Clone, Copy)]
pub struct ClaimOptions {
    pub ttl: u64,
    pub grace: u64,
}

/// Which non-active population of a queue to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Claimed,
    Delayed,
}

#[async_trait]
pub trait MessageController: Send + Sync {
    /// Stores a batch on a queue, returning the new message ids in order.
    async fn post(
        &self,
        queue: &str,
        messages: Vec<Message>,
        project: &str,
        client_uuid: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Acknowledges one claimed occurrence, transitioning it to deleted.
    async fn consume_delete(
        &self,
        queue: &str,
        handle: &str,
        project: &str,
    ) -> Result<(), StorageError>;

    /// Deletes the given claimed message ids, returning those actually
    /// deleted. Unknown or unclaimed ids are skipped, not errors.
    async fn bulk_consume_delete(
        &self,
        queue: &str,
        consume_ids: &[String],
        project: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Number of active (claimable) messages.
    async fn count(&self, queue: &str, project: &str) -> Result<usize, StorageError>;

    /// Number of currently claimed or currently delayed messages.
    async fn claimed_or_delay_count(
        &self,
        queue: &str,
        project: &str,
        kind: PendingKind,
    ) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait QueueController: Send + Sync {
    async fn get_metadata(&self, name: &str, project: &str) -> Result<Metadata, StorageError>;

    /// Creates the queue, returning false if it already existed.
    async fn create(&self, name: &str, project: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait ClaimController: Send + Sync {
    /// Claims up to `limit` active messages under a new claim id.
    async fn create(
        &self,
        queue: &str,
        options: ClaimOptions,
        project: &str,
        limit: Option<usize>,
    ) -> Result<(String, Vec<ClaimedMessage>), StorageError>;
}

#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Inserts a new record, returning false (and leaving the stored record
    /// untouched) if the key already exists.
    async fn insert(&self, topic: StoredTopic) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<StoredTopic>, StorageError>;

    /// Overwrites an existing record.
    async fn put(&self, topic: StoredTopic) -> Result<(), StorageError>;

    /// Removes a record, returning whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Records whose key starts with `prefix` and sorts after `marker_key`,
    /// in key order, at most `limit`.
    async fn scan(
        &self,
        prefix: &str,
        marker_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredTopic>, StorageError>;

    /// Atomically adds to the message counter, returning the new value.
    async fn increment_counter(&self, key: &str, amount: u64) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Inserts a new record, returning false if the key already exists.
    async fn insert(&self, record: StoredMonitor) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<StoredMonitor>, StorageError>;

    /// Atomically adds the deltas to one record. Returns false if the
    /// record does not exist; partial application never occurs.
    async fn add(
        &self,
        key: &str,
        deltas: &[(&'static str, u64)],
    ) -> Result<bool, StorageError>;

    /// Records with key strictly greater than `marker`, filtered by type
    /// and project, in key order, at most `limit`.
    async fn scan(
        &self,
        m_type: Option<MonitorType>,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMonitor>, StorageError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: Subscription) -> Result<(), StorageError>;

    async fn get(&self, project: &str, id: &str) -> Result<Option<Subscription>, StorageError>;

    async fn remove(&self, project: &str, id: &str) -> Result<bool, StorageError>;

    /// Subscriptions of one topic, id-ascending, starting strictly after
    /// `marker`, at most `limit`.
    async fn scan(
        &self,
        project: &str,
        source: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Subscription>, StorageError>;
}
