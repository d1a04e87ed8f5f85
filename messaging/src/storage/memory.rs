//! Process-local reference driver.
//!
//! Implements every storage trait over mutex-guarded ordered maps. Scoped
//! keys (`project/name`) give the same listing order a production driver
//! gets from its indexes, and the single lock per driver serializes the
//! read-modify-write monitor updates the accounting contract requires.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::message::{ClaimedMessage, Message};
use crate::monitor::{MonitorType, StoredMonitor};
use crate::storage::{
    ClaimController, ClaimOptions, MessageController, Metadata, MonitorStore, PendingKind,
    QueueController, StorageError, SubscriptionStore, TopicStore,
};
use crate::subscription::Subscription;
use crate::topic::{scope, StoredTopic};

const DEFAULT_MESSAGES_PER_CLAIM: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MessageState {
    Active,
    Claimed { cid: String },
    Deleted,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: serde_json::Value,
    ttl: u64,
    delay_ttl: u64,
    created_at: OffsetDateTime,
    state: MessageState,
}

impl StoredMessage {
    fn age(&self, now: OffsetDateTime) -> u64 {
        (now - self.created_at).whole_seconds().max(0) as u64
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.ttl > 0 && self.age(now) >= self.ttl
    }

    fn is_delayed(&self, now: OffsetDateTime) -> bool {
        self.delay_ttl > 0 && self.age(now) < self.delay_ttl
    }
}

#[derive(Debug, Clone)]
struct ClaimState {
    ttl: u64,
    created_at: OffsetDateTime,
}

impl ClaimState {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        (now - self.created_at).whole_seconds().max(0) as u64 >= self.ttl
    }
}

#[derive(Debug, Default)]
struct QueueState {
    metadata: Metadata,
    /// Insertion-ordered; claims walk this front to back.
    messages: Vec<StoredMessage>,
    claims: HashMap<String, ClaimState>,
}

impl QueueState {
    /// Whether a message currently counts as claimed (its claim is live).
    fn is_claimed(&self, message: &StoredMessage, now: OffsetDateTime) -> bool {
        match &message.state {
            MessageState::Claimed { cid } => self
                .claims
                .get(cid)
                .map(|claim| !claim.is_expired(now))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn is_claimable(&self, message: &StoredMessage, now: OffsetDateTime) -> bool {
        !matches!(message.state, MessageState::Deleted)
            && !self.is_claimed(message, now)
            && !message.is_delayed(now)
            && !message.is_expired(now)
    }
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, QueueState>,
    topics: BTreeMap<String, StoredTopic>,
    monitors: BTreeMap<String, StoredMonitor>,
    /// Keyed `project/id`; iteration within a project is id-ascending.
    subscriptions: BTreeMap<String, Subscription>,
}

/// The in-memory driver. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock means a panic mid-mutation; tests surface it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageController for MemoryDriver {
    async fn post(
        &self,
        queue: &str,
        messages: Vec<Message>,
        project: &str,
        _client_uuid: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut state = self.lock();
        let queue_state = state.queues.entry(scope(project, queue)).or_default();
        let now = OffsetDateTime::now_utc();
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = Uuid::new_v4().to_string();
            queue_state.messages.push(StoredMessage {
                id: id.clone(),
                body: message.body,
                ttl: message.ttl,
                delay_ttl: message.delay_ttl,
                created_at: now,
                state: MessageState::Active,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn consume_delete(
        &self,
        queue: &str,
        handle: &str,
        project: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let queue_state = state
            .queues
            .get_mut(&scope(project, queue))
            .ok_or_else(|| StorageError::MessageHandleInvalid(handle.to_string()))?;

        let (cid, message_id) = handle
            .split_once('.')
            .ok_or_else(|| StorageError::MessageHandleInvalid(handle.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let live = queue_state
            .claims
            .get(cid)
            .map(|claim| !claim.is_expired(now))
            .unwrap_or(false);
        if !live {
            return Err(StorageError::MessageClaimedExpired(handle.to_string()));
        }

        let message = queue_state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.state == MessageState::Claimed { cid: cid.to_string() })
            .ok_or_else(|| StorageError::MessageHandleInvalid(handle.to_string()))?;
        message.state = MessageState::Deleted;
        Ok(())
    }

    async fn bulk_consume_delete(
        &self,
        queue: &str,
        consume_ids: &[String],
        project: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut state = self.lock();
        let queue_state = match state.queues.get_mut(&scope(project, queue)) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        let now = OffsetDateTime::now_utc();
        let mut deleted = Vec::new();
        for message in queue_state.messages.iter_mut() {
            if !consume_ids.contains(&message.id) {
                continue;
            }
            let live = match &message.state {
                MessageState::Claimed { cid } => queue_state
                    .claims
                    .get(cid)
                    .map(|claim| !claim.is_expired(now))
                    .unwrap_or(false),
                _ => false,
            };
            if live {
                message.state = MessageState::Deleted;
                deleted.push(message.id.clone());
            }
        }
        Ok(deleted)
    }

    async fn count(&self, queue: &str, project: &str) -> Result<usize, StorageError> {
        let state = self.lock();
        let now = OffsetDateTime::now_utc();
        Ok(state
            .queues
            .get(&scope(project, queue))
            .map(|q| q.messages.iter().filter(|m| q.is_claimable(m, now)).count())
            .unwrap_or(0))
    }

    async fn claimed_or_delay_count(
        &self,
        queue: &str,
        project: &str,
        kind: PendingKind,
    ) -> Result<usize, StorageError> {
        let state = self.lock();
        let now = OffsetDateTime::now_utc();
        Ok(state
            .queues
            .get(&scope(project, queue))
            .map(|q| {
                q.messages
                    .iter()
                    .filter(|m| match kind {
                        PendingKind::Claimed => q.is_claimed(m, now),
                        PendingKind::Delayed => {
                            !matches!(m.state, MessageState::Deleted) && m.is_delayed(now)
                        }
                    })
                    .count()
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl QueueController for MemoryDriver {
    async fn get_metadata(&self, name: &str, project: &str) -> Result<Metadata, StorageError> {
        let state = self.lock();
        state
            .queues
            .get(&scope(project, name))
            .map(|q| q.metadata.clone())
            .ok_or_else(|| StorageError::QueueDoesNotExist(name.to_string()))
    }

    async fn create(&self, name: &str, project: &str) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let key = scope(project, name);
        if state.queues.contains_key(&key) {
            return Ok(false);
        }
        state.queues.insert(key, QueueState::default());
        Ok(true)
    }
}

#[async_trait]
impl ClaimController for MemoryDriver {
    async fn create(
        &self,
        queue: &str,
        options: ClaimOptions,
        project: &str,
        limit: Option<usize>,
    ) -> Result<(String, Vec<ClaimedMessage>), StorageError> {
        let mut state = self.lock();
        let queue_state = state
            .queues
            .get_mut(&scope(project, queue))
            .ok_or_else(|| StorageError::QueueDoesNotExist(queue.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let cid = Uuid::new_v4().to_string();
        let limit = limit.unwrap_or(DEFAULT_MESSAGES_PER_CLAIM);

        let claimable: Vec<usize> = queue_state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| queue_state.is_claimable(m, now))
            .map(|(i, _)| i)
            .take(limit)
            .collect();

        let mut claimed = Vec::with_capacity(claimable.len());
        for index in claimable {
            let message = &mut queue_state.messages[index];
            message.state = MessageState::Claimed { cid: cid.clone() };
            claimed.push(ClaimedMessage {
                id: message.id.clone(),
                ttl: message.ttl,
                age: message.age(now),
                body: message.body.clone(),
                handle: format!("{}.{}", cid, message.id),
            });
        }

        if !claimed.is_empty() {
            queue_state.claims.insert(
                cid.clone(),
                ClaimState {
                    ttl: options.ttl,
                    created_at: now,
                },
            );
        }
        Ok((cid, claimed))
    }
}

#[async_trait]
impl TopicStore for MemoryDriver {
    async fn insert(&self, topic: StoredTopic) -> Result<bool, StorageError> {
        let mut state = self.lock();
        if state.topics.contains_key(&topic.key) {
            return Ok(false);
        }
        state.topics.insert(topic.key.clone(), topic);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredTopic>, StorageError> {
        Ok(self.lock().topics.get(key).cloned())
    }

    async fn put(&self, topic: StoredTopic) -> Result<(), StorageError> {
        self.lock().topics.insert(topic.key.clone(), topic);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().topics.remove(key).is_some())
    }

    async fn scan(
        &self,
        prefix: &str,
        marker_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredTopic>, StorageError> {
        let state = self.lock();
        Ok(state
            .topics
            .values()
            .filter(|t| t.key.starts_with(prefix))
            .filter(|t| marker_key.map(|m| t.key.as_str() > m).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn increment_counter(&self, key: &str, amount: u64) -> Result<u64, StorageError> {
        let mut state = self.lock();
        let topic = state
            .topics
            .get_mut(key)
            .ok_or_else(|| StorageError::TopicDoesNotExist(key.to_string()))?;
        topic.message_counter += amount;
        Ok(topic.message_counter)
    }
}

#[async_trait]
impl MonitorStore for MemoryDriver {
    async fn insert(&self, record: StoredMonitor) -> Result<bool, StorageError> {
        let mut state = self.lock();
        if state.monitors.contains_key(&record.key) {
            return Ok(false);
        }
        state.monitors.insert(record.key.clone(), record);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredMonitor>, StorageError> {
        Ok(self.lock().monitors.get(key).cloned())
    }

    async fn add(
        &self,
        key: &str,
        deltas: &[(&'static str, u64)],
    ) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let record = match state.monitors.get_mut(key) {
            Some(r) => r,
            None => return Ok(false),
        };
        for (field, delta) in deltas {
            *record.values.entry(field.to_string()).or_insert(0) += delta;
        }
        Ok(true)
    }

    async fn scan(
        &self,
        m_type: Option<MonitorType>,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMonitor>, StorageError> {
        let state = self.lock();
        Ok(state
            .monitors
            .values()
            .filter(|r| m_type.map(|t| r.m_type == t).unwrap_or(true))
            .filter(|r| project.map(|p| r.project == p).unwrap_or(true))
            .filter(|r| marker.map(|m| r.key.as_str() > m).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryDriver {
    async fn insert(&self, subscription: Subscription) -> Result<(), StorageError> {
        let mut state = self.lock();
        let key = scope(&subscription.project, &subscription.id);
        state.subscriptions.insert(key, subscription);
        Ok(())
    }

    async fn get(&self, project: &str, id: &str) -> Result<Option<Subscription>, StorageError> {
        Ok(self.lock().subscriptions.get(&scope(project, id)).cloned())
    }

    async fn remove(&self, project: &str, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .lock()
            .subscriptions
            .remove(&scope(project, id))
            .is_some())
    }

    async fn scan(
        &self,
        project: &str,
        source: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Subscription>, StorageError> {
        let state = self.lock();
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.project == project)
            .filter(|s| s.source == source)
            .filter(|s| marker.map(|m| s.id.as_str() > m).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }
}
