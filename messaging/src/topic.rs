//! Topic metadata store: tenant-scoped CRUD, reserved-key defaulting, a
//! monotonically increasing message counter, and an `{add, replace,
//! remove}` metadata patch.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::TopicDefaults;
use crate::monitor::{MonitorController, MonitorType};
use crate::storage::{Metadata, StorageError, TopicStore};

/// Content type required by the metadata patch endpoint.
pub const JSON_PATCH_CONTENT_TYPE: &str = "application/openstack-messaging-v2.0-json-patch";

pub const DEFAULT_TOPICS_PER_PAGE: usize = 10;

/// Scoped storage key. Reversible: the project never contains the
/// delimiter.
pub fn scope(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

pub fn descope(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// The persisted record shape.
#[derive(Debug, Clone)]
pub struct StoredTopic {
    pub key: String,
    pub metadata: Metadata,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub message_counter: u64,
}

/// A topic as surfaced to callers.
#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub metadata: Metadata,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub message_counter: u64,
}

impl Topic {
    fn from_stored(stored: StoredTopic) -> Self {
        let (_, name) = descope(&stored.key);
        Self {
            name: name.to_string(),
            metadata: stored.metadata,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            message_counter: stored.message_counter,
        }
    }
}

/// One listing row; metadata and stamps only when a detailed listing was
/// requested.
#[derive(Debug, Clone)]
pub struct TopicListing {
    pub name: String,
    pub metadata: Option<Metadata>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

/// One metadata patch operation over a top-level key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Creates or overwrites.
    Add { path: String, value: serde_json::Value },
    /// Overwrites; the key must exist.
    Replace { path: String, value: serde_json::Value },
    /// Removes; reserved keys are re-defaulted instead.
    Remove { path: String },
}

impl PatchOp {
    /// The targeted top-level key: the last segment of a `/`-separated
    /// pointer, or the bare key itself.
    fn key(&self) -> &str {
        let path = match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        };
        path.rsplit('/').next().unwrap_or(path)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    #[error("can't {op} non-existent metadata key {key}")]
    Conflict { op: &'static str, key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PatchError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Conflict { .. } => 409,
            Self::Storage(StorageError::TopicDoesNotExist(_)) => 404,
            Self::Storage(_) => 503,
        }
    }
}

fn is_reserved(key: &str) -> bool {
    key.starts_with('_')
}

/// Topic resource operations over an injected [`TopicStore`].
pub struct TopicController {
    store: Arc<dyn TopicStore>,
    monitor: Arc<MonitorController>,
    defaults: TopicDefaults,
}

impl TopicController {
    pub fn new(
        store: Arc<dyn TopicStore>,
        monitor: Arc<MonitorController>,
        defaults: TopicDefaults,
    ) -> Self {
        Self {
            store,
            monitor,
            defaults,
        }
    }

    /// Creates a topic, returning false if it already existed. The reserved
    /// metadata keys are filled in from config where the caller left them
    /// out, and a topic monitor record is requested alongside.
    pub async fn create(
        &self,
        name: &str,
        project: &str,
        metadata: Metadata,
    ) -> Result<bool, StorageError> {
        let mut metadata = metadata;
        for (key, value) in self.defaults.reserved_metadata() {
            metadata.entry(key).or_insert(value);
        }

        let now = OffsetDateTime::now_utc();
        let created = self
            .store
            .insert(StoredTopic {
                key: scope(project, name),
                metadata,
                created_at: now,
                updated_at: now,
                message_counter: 0,
            })
            .await?;

        if created {
            match self.monitor.create(name, MonitorType::Topics, project).await {
                Ok(()) | Err(StorageError::MonitorAlreadyExist(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    pub async fn get(&self, name: &str, project: &str) -> Result<Topic, StorageError> {
        let key = scope(project, name);
        self.store
            .get(&key)
            .await?
            .map(Topic::from_stored)
            .ok_or_else(|| StorageError::TopicDoesNotExist(key))
    }

    pub async fn exists(&self, name: &str, project: &str) -> Result<bool, StorageError> {
        Ok(self.store.get(&scope(project, name)).await?.is_some())
    }

    /// Deletes the topic. Deleting an absent topic is not an error.
    pub async fn delete(&self, name: &str, project: &str) -> Result<(), StorageError> {
        self.store.remove(&scope(project, name)).await?;
        Ok(())
    }

    /// One page of the project's topics in name order, plus the marker for
    /// the next page (the last listed name).
    pub async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: usize,
        detailed: bool,
    ) -> Result<(Vec<TopicListing>, Option<String>), StorageError> {
        let prefix = format!("{}/", project);
        let marker_key = marker.map(|m| scope(project, m));
        let records = self
            .store
            .scan(&prefix, marker_key.as_deref(), limit)
            .await?;

        let mut listings = Vec::with_capacity(records.len());
        for record in records {
            let (_, name) = descope(&record.key);
            listings.push(TopicListing {
                name: name.to_string(),
                metadata: detailed.then(|| record.metadata.clone()),
                created_at: detailed.then_some(record.created_at),
                updated_at: detailed.then_some(record.updated_at),
            });
        }
        let next_marker = listings.last().map(|t| t.name.clone());
        Ok((listings, next_marker))
    }

    /// Bumps the monotone message counter, returning the new value.
    pub async fn increment_message_counter(
        &self,
        name: &str,
        project: &str,
        amount: u64,
    ) -> Result<u64, StorageError> {
        self.store
            .increment_counter(&scope(project, name), amount)
            .await
    }

    /// Applies the patch operations in order. Any conflict aborts the whole
    /// patch; nothing is persisted unless every op applies.
    pub async fn patch_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[PatchOp],
    ) -> Result<Topic, PatchError> {
        let key = scope(project, name);
        let mut stored = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::TopicDoesNotExist(key))?;

        let reserved_defaults = self.defaults.reserved_metadata();
        for op in ops {
            let target = op.key().to_string();
            match op {
                PatchOp::Add { value, .. } => {
                    stored.metadata.insert(target, value.clone());
                }
                PatchOp::Replace { value, .. } => {
                    if !stored.metadata.contains_key(&target) {
                        return Err(PatchError::Conflict {
                            op: "replace",
                            key: target,
                        });
                    }
                    stored.metadata.insert(target, value.clone());
                }
                PatchOp::Remove { .. } => {
                    if is_reserved(&target) {
                        // Reserved keys never leave; removal restores the default.
                        let default = reserved_defaults
                            .get(&target)
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        stored.metadata.insert(target, default);
                    } else if stored.metadata.remove(&target).is_none() {
                        return Err(PatchError::Conflict {
                            op: "remove",
                            key: target,
                        });
                    }
                }
            }
        }

        stored.updated_at = OffsetDateTime::now_utc();
        self.store.put(stored.clone()).await?;
        Ok(Topic::from_stored(stored))
    }
}
