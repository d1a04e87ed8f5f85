use serde::{Deserialize, Serialize};

/// A message in flight through the service: an opaque JSON body plus the
/// delivery envelope stamped onto it along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: serde_json::Value,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub delay_ttl: u64,
    /// Source queue/topic, injected at delivery time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

impl Message {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            ttl: 0,
            delay_ttl: 0,
            queue_name: None,
        }
    }

    /// Accounting size: the byte length of the serialized body.
    pub fn body_size(&self) -> usize {
        serde_json::to_vec(&self.body).map(|b| b.len()).unwrap_or(0)
    }
}

/// Sum of serialized body sizes across a batch.
pub fn batch_size(messages: &[Message]) -> usize {
    messages.iter().map(Message::body_size).sum()
}

/// A message handed out by the claim controller. The handle is the one-shot
/// token a consumer uses to acknowledge (delete) this occurrence.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub id: String,
    pub ttl: u64,
    pub age: u64,
    pub body: serde_json::Value,
    pub handle: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn body_size_is_serialized_length() {
        let msg = Message::new(json!({"k": "v"}));
        assert_eq!(msg.body_size(), r#"{"k":"v"}"#.len());

        let batch = vec![msg.clone(), Message::new(json!("x"))];
        assert_eq!(batch_size(&batch), msg.body_size() + r#""x""#.len());
    }

    #[test]
    fn envelope_fields_do_not_leak_into_the_wire_shape_when_unset() {
        let msg = Message::new(json!({"a": 1}));
        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("queue_name").is_none());

        let mut stamped = msg;
        stamped.queue_name = Some("alerts".to_string());
        let wire = serde_json::to_value(&stamped).unwrap();
        assert_eq!(wire["queue_name"], json!("alerts"));
    }
}
