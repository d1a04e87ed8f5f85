//! The service facade: wires the controllers to a storage driver and
//! exposes the publish and consume ingresses.
//!
//! A `Service` should be created once at startup and shared; the storage
//! handles behind it are long-lived and thread-safe.
use std::sync::Arc;

use herald_retry::cancel::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::consume::{Consumed, ConsumeError, ConsumePath};
use crate::message::{batch_size, Message};
use crate::monitor::{CountType, MonitorController};
use crate::notify::{Notifier, NotifierDeps};
use crate::storage::memory::MemoryDriver;
use crate::storage::{
    ClaimController, MessageController, MonitorStore, QueueController, StorageError,
    SubscriptionStore, TopicStore,
};
use crate::subscription::SubscriptionController;
use crate::topic::TopicController;

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PublishError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Storage(StorageError::TopicDoesNotExist(_)) => 404,
            Self::Storage(_) => 503,
        }
    }
}

/// What a publish call achieved synchronously. Deliveries settle in the
/// background and are observable through the topic's monitor record.
#[derive(Debug, Clone, Copy)]
pub struct PublishReceipt {
    /// The topic's message counter after this batch.
    pub message_counter: u64,
    /// How many subscriptions the batch was dispatched to.
    pub subscriptions: usize,
}

/// The storage handles a service is built from. Production deployments
/// pass their driver's controllers; [`Service::in_memory`] wires the
/// reference driver into every slot.
pub struct StorageHandles {
    pub message: Arc<dyn MessageController>,
    pub queue: Arc<dyn QueueController>,
    pub claim: Arc<dyn ClaimController>,
    pub topic_store: Arc<dyn TopicStore>,
    pub monitor_store: Arc<dyn MonitorStore>,
    pub subscription_store: Arc<dyn SubscriptionStore>,
}

pub struct Service {
    config: Arc<Config>,
    topics: TopicController,
    subscriptions: SubscriptionController,
    monitor: Arc<MonitorController>,
    consume: ConsumePath,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(handles: StorageHandles, config: Config) -> Self {
        let config = Arc::new(config);
        let monitor = Arc::new(MonitorController::new(
            handles.monitor_store,
            handles.message.clone(),
        ));
        let topics = TopicController::new(
            handles.topic_store,
            monitor.clone(),
            config.topic_defaults.clone(),
        );
        let subscriptions = SubscriptionController::new(handles.subscription_store);
        let consume = ConsumePath::new(
            handles.queue.clone(),
            handles.message.clone(),
            handles.claim,
            monitor.clone(),
            config.clone(),
        );
        let cancel = CancellationToken::new();
        let notifier = Notifier::start(
            NotifierDeps {
                config: config.clone(),
                message: handles.message,
                queue: handles.queue,
                monitor: monitor.clone(),
            },
            cancel.clone(),
        );
        Self {
            config,
            topics,
            subscriptions,
            monitor,
            consume,
            notifier,
            cancel,
        }
    }

    /// A service backed entirely by the in-memory reference driver.
    pub fn in_memory(config: Config) -> Self {
        let driver = Arc::new(MemoryDriver::new());
        Self::new(
            StorageHandles {
                message: driver.clone(),
                queue: driver.clone(),
                claim: driver.clone(),
                topic_store: driver.clone(),
                monitor_store: driver.clone(),
                subscription_store: driver,
            },
            config,
        )
    }

    pub fn topics(&self) -> &TopicController {
        &self.topics
    }

    pub fn subscriptions(&self) -> &SubscriptionController {
        &self.subscriptions
    }

    pub fn monitors(&self) -> &MonitorController {
        &self.monitor
    }

    /// Publishes a batch to a topic and fans it out to every live
    /// subscription. Returns once the batch is accounted and enqueued for
    /// delivery.
    pub async fn publish(
        &self,
        project: &str,
        topic_name: &str,
        messages: Vec<Message>,
        client_uuid: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        if messages.is_empty() {
            return Err(PublishError::Validation(
                "a publish requires at least one message".to_string(),
            ));
        }

        let topic = self.topics.get(topic_name, project).await?;
        let max_size = topic
            .metadata
            .get("_max_messages_post_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.config.topic_defaults.max_messages_post_size);
        let size = batch_size(&messages) as u64;
        if size > max_size {
            return Err(PublishError::Validation(format!(
                "message batch of {} bytes exceeds the topic limit of {}",
                size, max_size
            )));
        }

        let default_ttl = topic
            .metadata
            .get("_default_message_ttl")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.config.topic_defaults.default_message_ttl);
        let mut messages = messages;
        for message in &mut messages {
            if message.ttl == 0 {
                message.ttl = default_ttl;
            }
        }

        let message_counter = self
            .topics
            .increment_message_counter(topic_name, project, messages.len() as u64)
            .await?;

        // Publish accounting never blocks delivery.
        if let Err(e) = self
            .monitor
            .update(&messages, topic_name, project, CountType::PublishMessages)
            .await
        {
            tracing::error!("publish accounting for topic {} failed: {}", topic_name, e);
        }

        let subscriptions = self.subscriptions.list_all(project, topic_name).await?;
        let dispatched = subscriptions.len();
        let client_uuid = client_uuid
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.notifier
            .dispatch(project, &client_uuid, topic_name, messages, subscriptions)
            .await;

        Ok(PublishReceipt {
            message_counter,
            subscriptions: dispatched,
        })
    }

    /// Claims up to `limit` messages from a queue; see
    /// [`ConsumePath::consume`].
    pub async fn consume(
        &self,
        queue_name: &str,
        project: &str,
        limit: Option<usize>,
        auto_delete: bool,
    ) -> Result<Consumed, ConsumeError> {
        self.consume.consume(queue_name, project, limit, auto_delete).await
    }

    pub async fn consume_delete(
        &self,
        queue_name: &str,
        handle: &str,
        project: &str,
    ) -> Result<(), ConsumeError> {
        self.consume.delete(queue_name, handle, project).await
    }

    pub async fn bulk_consume_delete(
        &self,
        queue_name: &str,
        consume_ids: &[String],
        project: &str,
    ) -> Result<Vec<String>, ConsumeError> {
        self.consume.bulk_delete(queue_name, consume_ids, project).await
    }

    /// Cancels in-flight deliveries and waits for the worker pool to
    /// drain.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.notifier.shutdown().await;
    }
}
