//! Subscription records: a binding from a topic to a subscriber URI with
//! delivery options and a TTL. Expired records are reaped lazily on read.
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::storage::{Metadata, StorageError, SubscriptionStore};

pub const DEFAULT_SUBSCRIPTIONS_PER_PAGE: usize = 10;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub project: String,
    /// The owning topic.
    pub source: String,
    /// `http(s)://…` for webhook delivery, `queue://project/name` for
    /// re-injection.
    pub subscriber: String,
    pub options: Metadata,
    pub ttl: u64,
    pub created_at: OffsetDateTime,
}

impl Subscription {
    /// The retry policy option, when set to a string value.
    pub fn push_policy(&self) -> Option<&str> {
        self.options.get("push_policy").and_then(|v| v.as_str())
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        let age = (now - self.created_at).whole_seconds();
        age >= 0 && age as u64 >= self.ttl
    }
}

pub struct SubscriptionController {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionController {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Registers a subscriber on a topic and returns the subscription id.
    /// Registering the same subscriber on the same topic again returns the
    /// existing id.
    pub async fn create(
        &self,
        project: &str,
        source: &str,
        subscriber: &str,
        ttl: u64,
        options: Metadata,
    ) -> Result<String, StorageError> {
        if let Some(existing) = self.find(project, source, subscriber).await? {
            return Ok(existing.id);
        }

        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            source: source.to_string(),
            subscriber: subscriber.to_string(),
            options,
            ttl,
            created_at: OffsetDateTime::now_utc(),
        };
        let id = subscription.id.clone();
        self.store.insert(subscription).await?;
        Ok(id)
    }

    pub async fn get(&self, project: &str, id: &str) -> Result<Subscription, StorageError> {
        let subscription = self
            .store
            .get(project, id)
            .await?
            .ok_or_else(|| StorageError::SubscriptionDoesNotExist(id.to_string()))?;
        if subscription.is_expired(OffsetDateTime::now_utc()) {
            self.store.remove(project, id).await?;
            return Err(StorageError::SubscriptionDoesNotExist(id.to_string()));
        }
        Ok(subscription)
    }

    /// Removes a subscription. Removing an absent one is not an error.
    pub async fn delete(&self, project: &str, id: &str) -> Result<(), StorageError> {
        self.store.remove(project, id).await?;
        Ok(())
    }

    /// One page of a topic's live subscriptions, id-ascending.
    pub async fn list(
        &self,
        project: &str,
        source: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Subscription>, Option<String>), StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut page = Vec::with_capacity(limit);
        let mut marker = marker.map(str::to_string);

        // Expired records do not count against the page, so keep scanning
        // until the page fills or the store runs dry.
        loop {
            let batch = self
                .store
                .scan(project, source, marker.as_deref(), limit - page.len())
                .await?;
            if batch.is_empty() {
                break;
            }
            marker = batch.last().map(|s| s.id.clone());
            for subscription in batch {
                if subscription.is_expired(now) {
                    self.store.remove(project, &subscription.id).await?;
                } else {
                    page.push(subscription);
                }
            }
            if page.len() >= limit {
                break;
            }
        }
        let next_marker = page.last().map(|s| s.id.clone());
        Ok((page, next_marker))
    }

    /// Every live subscription of a topic, for fan-out.
    pub async fn list_all(
        &self,
        project: &str,
        source: &str,
    ) -> Result<Vec<Subscription>, StorageError> {
        let mut all = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let (page, next) = self
                .list(project, source, marker.as_deref(), DEFAULT_SUBSCRIPTIONS_PER_PAGE)
                .await?;
            if page.is_empty() {
                break;
            }
            all.extend(page);
            marker = next;
        }
        Ok(all)
    }

    async fn find(
        &self,
        project: &str,
        source: &str,
        subscriber: &str,
    ) -> Result<Option<Subscription>, StorageError> {
        let mut marker: Option<String> = None;
        loop {
            let (page, next) = self
                .list(project, source, marker.as_deref(), DEFAULT_SUBSCRIPTIONS_PER_PAGE)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            if let Some(found) = page.into_iter().find(|s| s.subscriber == subscriber) {
                return Ok(Some(found));
            }
            marker = next;
        }
    }
}
