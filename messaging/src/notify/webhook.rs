//! Webhook delivery: POST each message of the batch to the subscriber URI.
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::message::Message;
use crate::monitor::CountType;
use crate::notify::{DeliveryContext, DeliveryError};
use crate::subscription::Subscription;

/// Template token replaced (quotes included) by the serialized message when
/// the subscription carries a `post_data` template.
const MESSAGE_TOKEN: &str = "\"$zaqar_message$\"";

/// Delivers the whole batch, one POST per message. Any transport failure
/// or non-2xx response fails the call; the retry engine re-attempts the
/// entire batch.
pub(crate) async fn execute(
    subscription: &Subscription,
    messages: &[Message],
    ctx: &DeliveryContext,
) -> Result<(), DeliveryError> {
    let template = subscription
        .options
        .get("post_data")
        .and_then(|v| v.as_str());
    let headers = merged_headers(subscription);

    for message in messages {
        let mut message = message.clone();
        message.queue_name = Some(subscription.source.clone());
        let serialized = serde_json::to_string(&message)?;
        let body = match template {
            Some(template) => template.replace(MESSAGE_TOKEN, &serialized),
            None => serialized,
        };

        ctx.http
            .post(&subscription.subscriber)
            .headers(headers.clone())
            .body(body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| DeliveryError::Http(subscription.subscriber.clone(), e))?;
    }

    tracing::debug!(
        "posted {} message(s) for subscription {}",
        messages.len(),
        subscription.id
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
    Ok(())
}

/// The subscription's `post_headers` merged over the default content type.
/// A custom header overrides the default; unparseable names or values are
/// skipped with a warning.
fn merged_headers(subscription: &Subscription) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(extra) = subscription
        .options
        .get("post_headers")
        .and_then(|v| v.as_object())
    {
        for (name, value) in extra {
            let Some(value) = value.as_str() else {
                continue;
            };
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(
                        "subscription {} carries unusable post header {:?}",
                        subscription.id,
                        name
                    );
                }
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::storage::Metadata;

    fn subscription(options: Metadata) -> Subscription {
        Subscription {
            id: "s1".to_string(),
            project: "p1".to_string(),
            source: "alerts".to_string(),
            subscriber: "https://hooks.example.com/a".to_string(),
            options,
            ttl: 3600,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn post_headers_override_the_default_content_type() {
        let mut options = Metadata::new();
        options.insert(
            "post_headers".to_string(),
            json!({"Content-Type": "text/plain", "X-Trace": "abc"}),
        );
        let headers = merged_headers(&subscription(options));
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(headers.get("X-Trace").unwrap(), "abc");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn default_headers_without_options() {
        let headers = merged_headers(&subscription(Metadata::new()));
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.len(), 1);
    }
}
