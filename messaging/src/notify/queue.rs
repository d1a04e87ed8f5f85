//! Queue re-injection delivery: stamp the batch with the destination
//! queue's TTLs and post it through the message controller.
use crate::message::Message;
use crate::monitor::CountType;
use crate::notify::{DeliveryContext, DeliveryError};
use crate::subscription::Subscription;

/// Resolves the destination queue from a `queue://` subscriber: the last
/// path segment after the last colon. Accepts both `queue://project/name`
/// and the legacy `queue:name` form.
fn target_queue(subscriber: &str) -> Option<&str> {
    let tail = subscriber.rsplit(':').next()?;
    let name = tail.trim_start_matches('/').rsplit('/').next()?;
    (!name.is_empty()).then_some(name)
}

/// Delivers the batch into the destination queue. A metadata lookup
/// failure aborts the attempt; the retry engine decides what happens next.
pub(crate) async fn execute(
    subscription: &Subscription,
    messages: &[Message],
    ctx: &DeliveryContext,
) -> Result<(), DeliveryError> {
    let queue_name = target_queue(&subscription.subscriber)
        .ok_or_else(|| DeliveryError::BadTarget(subscription.subscriber.clone()))?;

    let meta = ctx.queue.get_metadata(queue_name, &ctx.project).await?;
    let ttl = meta
        .get("_default_message_ttl")
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.config.queue_defaults.default_message_ttl);
    let delay_ttl = meta
        .get("delay_ttl")
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.config.queue_defaults.delay_ttl);

    let mut batch = messages.to_vec();
    for message in &mut batch {
        message.ttl = ttl;
        message.delay_ttl = delay_ttl;
    }

    let ids = ctx
        .message
        .post(queue_name, batch, &ctx.project, &ctx.client_uuid)
        .await?;
    tracing::debug!(
        "re-injected {} message(s) into queue {} for subscription {}: {:?}",
        messages.len(),
        queue_name,
        subscription.id,
        ids
    );

    // Accounting failures are logged, never redelivered.
    if let Err(e) = ctx
        .monitor
        .update(
            messages,
            &subscription.source,
            &ctx.project,
            CountType::SubscribeMessages { success: true },
        )
        .await
    {
        tracing::error!(
            "success accounting for topic {} failed: {}",
            subscription.source,
            e
        );
    }
    if let Err(e) = ctx
        .monitor
        .update(messages, queue_name, &ctx.project, CountType::SendMessages)
        .await
    {
        tracing::error!("send accounting for queue {} failed: {}", queue_name, e);
    }
    Ok(())
}
