//! The consume path: claim a batch from a queue, optionally auto-delete,
//! format the response envelope and account the consumption.
use std::sync::Arc;

use crate::config::Config;
use crate::message::{ClaimedMessage, Message};
use crate::monitor::{CountType, MonitorController};
use crate::storage::{
    ClaimController, ClaimOptions, MessageController, QueueController, StorageError,
};
use crate::validation;

#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConsumeError {
    /// HTTP-equivalent status for the transport layer.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Storage(StorageError::MessageClaimedExpired(_)) => 409,
            Self::Storage(StorageError::MessageHandleInvalid(_)) => 404,
            Self::Storage(_) => 503,
        }
    }
}

/// One consumed message in the response envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsumedMessage {
    pub id: String,
    pub ttl: u64,
    pub age: u64,
    pub body: serde_json::Value,
    pub href: String,
}

/// The result of one consume call. Empty `messages` maps to an empty
/// response at the transport layer.
#[derive(Debug, Clone)]
pub struct Consumed {
    pub queue: String,
    pub cid: String,
    pub messages: Vec<ConsumedMessage>,
}

impl Consumed {
    /// Path of the created consume claim, for the Location header.
    pub fn location(&self) -> String {
        format!("/v2/queues/{}/messages/consume/{}", self.queue, self.cid)
    }
}

pub struct ConsumePath {
    queue: Arc<dyn QueueController>,
    message: Arc<dyn MessageController>,
    claim: Arc<dyn ClaimController>,
    monitor: Arc<MonitorController>,
    config: Arc<Config>,
}

impl ConsumePath {
    pub fn new(
        queue: Arc<dyn QueueController>,
        message: Arc<dyn MessageController>,
        claim: Arc<dyn ClaimController>,
        monitor: Arc<MonitorController>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            queue,
            message,
            claim,
            monitor,
            config,
        }
    }

    /// Claims up to `limit` messages. Consuming from an absent queue
    /// creates it empty first. With `auto_delete`, every claimed message is
    /// acknowledged before the call returns.
    pub async fn consume(
        &self,
        queue_name: &str,
        project: &str,
        limit: Option<usize>,
        auto_delete: bool,
    ) -> Result<Consumed, ConsumeError> {
        if let Some(limit) = limit {
            validation::claim_limit(limit).map_err(|e| ConsumeError::Validation(e.to_string()))?;
        }

        let meta = match self.queue.get_metadata(queue_name, project).await {
            Ok(meta) => meta,
            Err(StorageError::QueueDoesNotExist(_)) => {
                validation::resource_name(queue_name)
                    .map_err(|e| ConsumeError::Validation(e.to_string()))?;
                self.queue.create(queue_name, project).await?;
                Default::default()
            }
            Err(e) => return Err(e.into()),
        };

        let claim_ttl = meta
            .get("claim_ttl")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.config.queue_defaults.claim_ttl);

        let (cid, claimed) = self
            .claim
            .create(
                queue_name,
                ClaimOptions {
                    ttl: claim_ttl,
                    grace: 0,
                },
                project,
                limit,
            )
            .await?;

        if auto_delete {
            for message in &claimed {
                self.message
                    .consume_delete(queue_name, &message.handle, project)
                    .await?;
            }
        }

        let messages: Vec<ConsumedMessage> = claimed
            .iter()
            .map(|m| format_message(m, queue_name, &cid))
            .collect();

        if !claimed.is_empty() {
            // Accounting never undoes a successful consume.
            let batch: Vec<Message> = claimed
                .iter()
                .map(|m| Message::new(m.body.clone()))
                .collect();
            if let Err(e) = self
                .monitor
                .update(&batch, queue_name, project, CountType::ConsumeMessages)
                .await
            {
                tracing::error!("consume accounting for queue {} failed: {}", queue_name, e);
            }
        }

        Ok(Consumed {
            queue: queue_name.to_string(),
            cid,
            messages,
        })
    }

    /// Deletes the given consumed message ids, returning those actually
    /// deleted.
    pub async fn bulk_delete(
        &self,
        queue_name: &str,
        consume_ids: &[String],
        project: &str,
    ) -> Result<Vec<String>, ConsumeError> {
        if consume_ids.is_empty() {
            return Err(ConsumeError::Validation(
                "ids must contain at least one consume id".to_string(),
            ));
        }
        Ok(self
            .message
            .bulk_consume_delete(queue_name, consume_ids, project)
            .await?)
    }

    /// Acknowledges a single handle.
    pub async fn delete(
        &self,
        queue_name: &str,
        handle: &str,
        project: &str,
    ) -> Result<(), ConsumeError> {
        Ok(self
            .message
            .consume_delete(queue_name, handle, project)
            .await?)
    }
}

fn format_message(message: &ClaimedMessage, queue_name: &str, cid: &str) -> ConsumedMessage {
    ConsumedMessage {
        id: message.id.clone(),
        ttl: message.ttl,
        age: message.age,
        body: message.body.clone(),
        href: format!(
            "/v2/queues/{}/messages/{}?claim_id={}",
            queue_name, message.id, cid
        ),
    }
}
