//! Monitor accounting: per-queue and per-topic byte/count statistics,
//! keyed `project/type/name`, updated additively from the publish, delivery
//! and consume paths.
//!
//! Records store short field names; reads normalize into the long external
//! names, with `*_counts` as integers and `*_bytes` as kilobytes.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::message::{batch_size, Message};
use crate::storage::{MessageController, MonitorStore, PendingKind, StorageError};

pub const DEFAULT_MONITORS_PER_PAGE: usize = 10;

/// Short stored field → long external name, queue records.
pub const QUEUE_MONITOR: &[(&str, &str)] = &[
    ("mc", "msg_counts"),
    ("mb", "msg_bytes"),
    ("bmc", "bulk_msg_counts"),
    ("bmb", "bulk_msg_bytes"),
    ("cmc", "consume_msg_counts"),
    ("cmb", "consume_msg_bytes"),
];

/// Short stored field → long external name, topic records.
pub const TOPIC_MONITOR: &[(&str, &str)] = &[
    ("mc", "msg_counts"),
    ("mb", "msg_bytes"),
    ("bmc", "bulk_msg_counts"),
    ("bmb", "bulk_msg_bytes"),
    ("tsmc", "total_sub_msg_counts"),
    ("tsmb", "total_sub_msg_bytes"),
    ("smc", "sub_msg_counts"),
    ("smb", "sub_msg_bytes"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorType {
    Queues,
    Topics,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queues => "queues",
            Self::Topics => "topics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queues" => Some(Self::Queues),
            "topics" => Some(Self::Topics),
            _ => None,
        }
    }

    fn fields(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Queues => QUEUE_MONITOR,
            Self::Topics => TOPIC_MONITOR,
        }
    }
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which ingress an update is accounting for. The target record type and
/// the incremented fields follow from the variant and the batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
    /// Messages posted to a queue.
    SendMessages,
    /// Messages published to a topic.
    PublishMessages,
    /// Messages claimed from a queue by a consumer.
    ConsumeMessages,
    /// A subscription delivery: delivered (`success`) or exhausted.
    SubscribeMessages { success: bool },
}

impl CountType {
    pub fn monitor_type(&self) -> MonitorType {
        match self {
            Self::SendMessages | Self::ConsumeMessages => MonitorType::Queues,
            Self::PublishMessages | Self::SubscribeMessages { .. } => MonitorType::Topics,
        }
    }
}

pub fn monitor_key(project: &str, m_type: MonitorType, name: &str) -> String {
    format!("{}/{}/{}", project, m_type.as_str(), name)
}

/// The persisted record shape. Counter values are native integers.
#[derive(Debug, Clone)]
pub struct StoredMonitor {
    pub key: String,
    pub project: String,
    pub m_type: MonitorType,
    pub values: HashMap<String, u64>,
}

impl StoredMonitor {
    /// A record with every counter of its type present and zero.
    pub fn zeroed(name: &str, m_type: MonitorType, project: &str) -> Self {
        Self {
            key: monitor_key(project, m_type, name),
            project: project.to_string(),
            m_type,
            values: m_type
                .fields()
                .iter()
                .map(|(short, _)| (short.to_string(), 0))
                .collect(),
        }
    }

    fn raw(&self, short: &str) -> u64 {
        self.values.get(short).copied().unwrap_or(0)
    }
}

/// A normalized record as surfaced to callers: long counter names, counts
/// as integers, bytes as kilobytes.
#[derive(Debug, Clone)]
pub struct Monitor {
    pub key: String,
    pub counters: BTreeMap<String, serde_json::Value>,
}

impl Monitor {
    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn signed(&self, name: &str) -> i64 {
        self.counters.get(name).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    pub fn kilobytes(&self, name: &str) -> f64 {
        self.counters.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }
}

/// Persists and serves monitor records. Updates to one key are atomic
/// read-modify-write in the store; queue reads join in live message counts
/// from the message controller.
pub struct MonitorController {
    store: Arc<dyn MonitorStore>,
    messages: Arc<dyn MessageController>,
}

impl MonitorController {
    pub fn new(store: Arc<dyn MonitorStore>, messages: Arc<dyn MessageController>) -> Self {
        Self { store, messages }
    }

    /// Creates a zero-initialized record, failing if the key exists.
    pub async fn create(
        &self,
        name: &str,
        m_type: MonitorType,
        project: &str,
    ) -> Result<(), StorageError> {
        let record = StoredMonitor::zeroed(name, m_type, project);
        let key = record.key.clone();
        if !self.store.insert(record).await? {
            return Err(StorageError::MonitorAlreadyExist(key));
        }
        Ok(())
    }

    pub async fn get(
        &self,
        name: &str,
        m_type: MonitorType,
        project: &str,
    ) -> Result<Monitor, StorageError> {
        let key = monitor_key(project, m_type, name);
        let record = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::MonitorDoesNotExist(key))?;
        self.normalize(&record).await
    }

    /// Records with key > `marker`, key-ascending, at most `limit`, plus
    /// the marker for the next page.
    pub async fn list(
        &self,
        m_type: Option<MonitorType>,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
        all_project: bool,
    ) -> Result<(Vec<Monitor>, Option<String>), StorageError> {
        let scoped_project = if all_project { None } else { project };
        let records = self.store.scan(m_type, scoped_project, marker, limit).await?;
        let next_marker = records.last().map(|r| r.key.clone());
        let mut monitors = Vec::with_capacity(records.len());
        for record in &records {
            monitors.push(self.normalize(record).await?);
        }
        Ok((monitors, next_marker))
    }

    /// Additive update for one batch. Creates the record on first miss and
    /// retries the add exactly once; a second miss is an error.
    pub async fn update(
        &self,
        messages: &[Message],
        name: &str,
        project: &str,
        count_type: CountType,
    ) -> Result<(), StorageError> {
        let n = messages.len() as u64;
        let b = batch_size(messages) as u64;
        let deltas: [(&'static str, u64); 2] = match count_type {
            CountType::SendMessages | CountType::PublishMessages => {
                if n > 1 {
                    [("bmc", n), ("bmb", b)]
                } else {
                    [("mc", n), ("mb", b)]
                }
            }
            CountType::ConsumeMessages => [("cmc", n), ("cmb", b)],
            CountType::SubscribeMessages { success: true } => [("smc", n), ("smb", b)],
            CountType::SubscribeMessages { success: false } => [("tsmc", n), ("tsmb", b)],
        };

        let m_type = count_type.monitor_type();
        let key = monitor_key(project, m_type, name);
        if self.store.add(&key, &deltas).await? {
            return Ok(());
        }

        // First update wins the record creation; losing a race here is fine.
        match self.create(name, m_type, project).await {
            Ok(()) | Err(StorageError::MonitorAlreadyExist(_)) => {}
            Err(e) => return Err(e),
        }
        if self.store.add(&key, &deltas).await? {
            return Ok(());
        }
        Err(StorageError::MonitorDoesNotExist(key))
    }

    async fn normalize(&self, record: &StoredMonitor) -> Result<Monitor, StorageError> {
        let mut counters = BTreeMap::new();
        for (short, long) in record.m_type.fields() {
            let raw = record.raw(short);
            let value = if long.contains("bytes") {
                serde_json::json!(raw as f64 / 1024.0)
            } else {
                serde_json::json!(raw)
            };
            counters.insert(long.to_string(), value);
        }

        let mut monitor = Monitor {
            key: record.key.clone(),
            counters,
        };
        if record.m_type == MonitorType::Queues {
            self.join_queue_counts(record, &mut monitor).await?;
        }
        Ok(monitor)
    }

    /// Live message populations for a queue record. `deleted_msgs` is
    /// derived from two asynchronously updated quantities and may dip
    /// negative under concurrent writers; displaying callers clamp it.
    async fn join_queue_counts(
        &self,
        record: &StoredMonitor,
        monitor: &mut Monitor,
    ) -> Result<(), StorageError> {
        let (project, name) = match record.key.splitn(3, '/').collect::<Vec<_>>()[..] {
            [project, _, name] => (project, name),
            _ => return Err(StorageError::Unavailable(format!("bad monitor key {}", record.key))),
        };

        let active = self.messages.count(name, project).await? as i64;
        let inactive = self
            .messages
            .claimed_or_delay_count(name, project, PendingKind::Claimed)
            .await? as i64;
        let delayed = self
            .messages
            .claimed_or_delay_count(name, project, PendingKind::Delayed)
            .await? as i64;
        let deleted =
            (record.raw("bmc") + record.raw("mc")) as i64 - (active + inactive + delayed);

        monitor
            .counters
            .insert("active_msgs".to_string(), serde_json::json!(active));
        monitor
            .counters
            .insert("inactive_msgs".to_string(), serde_json::json!(inactive));
        monitor
            .counters
            .insert("delayed_msgs".to_string(), serde_json::json!(delayed));
        monitor
            .counters
            .insert("deleted_msgs".to_string(), serde_json::json!(deleted));
        Ok(())
    }
}
