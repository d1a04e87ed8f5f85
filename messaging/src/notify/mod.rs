//! Notification dispatch: fan-out of published messages to a topic's
//! subscriptions over a bounded worker pool, with per-subscription retry
//! and monitor accounting.
pub mod queue;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use herald_retry::cancel::CancellationToken;
use herald_retry::retry::{self, Outcome, Schedule};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::message::Message;
use crate::monitor::{CountType, MonitorController};
use crate::storage::{MessageController, QueueController, StorageError};
use crate::subscription::Subscription;

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("webhook post to {0} failed: {1}")]
    Http(String, #[source] reqwest::Error),

    #[error("message could not be rendered: {0}")]
    Render(#[from] serde_json::Error),

    #[error("subscriber {0} has no usable delivery target")]
    BadTarget(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything a delivery task needs: controllers, tenant identity, config
/// and the owning worker's HTTP client.
pub struct DeliveryContext {
    pub project: String,
    pub client_uuid: String,
    pub config: Arc<Config>,
    pub message: Arc<dyn MessageController>,
    pub queue: Arc<dyn QueueController>,
    pub monitor: Arc<MonitorController>,
    pub http: reqwest::Client,
}

struct Job {
    project: String,
    client_uuid: String,
    topic: String,
    messages: Arc<Vec<Message>>,
    subscription: Subscription,
}

/// Shared handles the workers are built from.
#[derive(Clone)]
pub struct NotifierDeps {
    pub config: Arc<Config>,
    pub message: Arc<dyn MessageController>,
    pub queue: Arc<dyn QueueController>,
    pub monitor: Arc<MonitorController>,
}

/// The dispatcher. One unbounded job channel drained by a fixed pool of
/// workers; each worker owns its own HTTP client so connections pool per
/// worker.
pub struct Notifier {
    sender: async_channel::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Notifier {
    pub fn start(deps: NotifierDeps, cancel: CancellationToken) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        let worker_count = deps.config.notification.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(run_worker(
                id,
                receiver.clone(),
                deps.clone(),
                cancel.clone(),
            ));
        }
        Self { sender, workers }
    }

    /// Hands one job per subscription to the pool. Returns once every job
    /// is enqueued; completion is observable only through monitor updates.
    pub async fn dispatch(
        &self,
        project: &str,
        client_uuid: &str,
        topic: &str,
        messages: Vec<Message>,
        subscriptions: Vec<Subscription>,
    ) {
        let messages = Arc::new(messages);
        for subscription in subscriptions {
            let job = Job {
                project: project.to_string(),
                client_uuid: client_uuid.to_string(),
                topic: topic.to_string(),
                messages: messages.clone(),
                subscription,
            };
            if self.sender.send(job).await.is_err() {
                tracing::warn!("notifier is shut down, dropping dispatch for topic {}", topic);
                return;
            }
        }
    }

    /// Closes the job channel and waits for in-flight deliveries to settle.
    pub async fn shutdown(&mut self) {
        self.sender.close();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

fn run_worker(
    id: usize,
    receiver: async_channel::Receiver<Job>,
    deps: NotifierDeps,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::trace!("start notifier worker {}", id);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                deps.config.notification.request_timeout_secs,
            ))
            .build()
            .unwrap_or_default();

        while let Ok(job) = receiver.recv().await {
            let ctx = DeliveryContext {
                project: job.project.clone(),
                client_uuid: job.client_uuid.clone(),
                config: deps.config.clone(),
                message: deps.message.clone(),
                queue: deps.queue.clone(),
                monitor: deps.monitor.clone(),
                http: http.clone(),
            };
            deliver(&job, &ctx, &cancel).await;
        }
        tracing::trace!("stop notifier worker {}", id);
    })
}

/// Runs one subscription's delivery under its retry schedule and reports
/// the outcome to the monitor controller.
async fn deliver(job: &Job, ctx: &DeliveryContext, cancel: &CancellationToken) {
    let subscription = &job.subscription;
    let scheme = Url::parse(&subscription.subscriber)
        .map(|u| u.scheme().to_string())
        .unwrap_or_default();

    let schedule = Schedule::from_push_policy(
        subscription.push_policy(),
        ctx.config.notification.max_notifier_retries,
    );

    let outcome: Outcome<(), DeliveryError> = match scheme.as_str() {
        "http" | "https" => {
            retry::invoke(Some(cancel.clone()), schedule, || {
                webhook::execute(subscription, &job.messages, ctx)
            })
            .await
        }
        "queue" => {
            retry::invoke(Some(cancel.clone()), schedule, || {
                queue::execute(subscription, &job.messages, ctx)
            })
            .await
        }
        other => {
            // Nothing to retry: no task will ever handle this subscriber.
            tracing::warn!(
                "subscription {} has unsupported scheme {:?}, skipping",
                subscription.id,
                other
            );
            report_failure(job, ctx).await;
            return;
        }
    };

    match outcome {
        Outcome::Delivered { attempts, .. } => {
            tracing::debug!(
                "delivered {} messages to subscription {} in {} attempt(s)",
                job.messages.len(),
                subscription.id,
                attempts
            );
        }
        Outcome::Failed {
            attempts,
            last_error,
        } => {
            tracing::debug!(
                "subscription {} exhausted after {} attempt(s): {}",
                subscription.id,
                attempts,
                last_error
            );
            report_failure(job, ctx).await;
        }
        Outcome::Cancelled { attempts } => {
            tracing::debug!(
                "delivery to subscription {} cancelled after {} attempt(s)",
                subscription.id,
                attempts
            );
        }
    }
}

async fn report_failure(job: &Job, ctx: &DeliveryContext) {
    if let Err(e) = ctx
        .monitor
        .update(
            &job.messages,
            &job.topic,
            &job.project,
            CountType::SubscribeMessages { success: false },
        )
        .await
    {
        tracing::error!("failure accounting for topic {} failed: {}", job.topic, e);
    }
}
