use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which configured topic a profile writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicRole {
    Primary,
    Secondary,
    DeadLetter,
}

/// Body of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Bytes),
}

impl Payload {
    pub fn to_bytes(&self) -> crate::Result<Bytes> {
        match self {
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Payload::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// JSON rendering used inside dead-letter records. Raw bytes that are
    /// valid JSON are embedded as-is, anything else is base64 encoded.
    fn to_record_value(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Bytes(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => value,
                Err(_) => json!({ "base64": BASE64.encode(bytes) }),
            },
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

/// One message addressed to a topic under a named delivery profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: Option<String>,
    pub payload: Payload,
    pub target_topic: String,
    pub profile: String,
}

impl Message {
    pub fn new(
        key: Option<String>,
        payload: impl Into<Payload>,
        target_topic: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            key,
            payload: payload.into(),
            target_topic: target_topic.into(),
            profile: profile.into(),
        }
    }

    /// Key for log fields; empty when the message is unkeyed.
    pub fn key_str(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }
}

/// Terminal record describing a message that could not be delivered or
/// processed. Written once, best-effort, and never re-routed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub original: Message,
    pub error_reason: String,
    pub observed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original: Message, error_reason: impl Into<String>) -> Self {
        let mut error_reason = error_reason.into();
        if error_reason.trim().is_empty() {
            error_reason = "unknown error".to_string();
        }
        Self {
            original,
            error_reason,
            observed_at: Utc::now(),
        }
    }

    /// JSON document written to the dead-letter topic. Consumers of that
    /// topic should treat it as opaque text; no schema version is promised.
    pub fn to_json(&self) -> Value {
        json!({
            "original": {
                "key": self.original.key,
                "topic": self.original.target_topic,
                "profile": self.original.profile,
                "payload": self.original.payload.to_record_value(),
            },
            "error": self.error_reason,
            "observed_at": self.observed_at.to_rfc3339(),
        })
    }
}

/// Desired shape of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// A record handed to a consumption pipeline by its source.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_embeds_json_payload() {
        let message = Message::new(Some("o1".to_string()), json!({"orderId": "o1"}), "order-events", "standard");
        let record = DeadLetterRecord::new(message, "broker unreachable");
        let doc = record.to_json();

        assert_eq!(doc["original"]["key"], "o1");
        assert_eq!(doc["original"]["payload"]["orderId"], "o1");
        assert_eq!(doc["error"], "broker unreachable");
    }

    #[test]
    fn test_dead_letter_base64_for_binary_payload() {
        let message = Message::new(Some("k".to_string()), vec![0xff_u8, 0x00, 0x10], "order-events", "standard");
        let doc = DeadLetterRecord::new(message, "bad").to_json();

        assert_eq!(doc["original"]["payload"]["base64"], "/wAQ");
    }

    #[test]
    fn test_dead_letter_reason_never_empty() {
        let message = Message::new(None, json!({}), "order-events", "standard");
        let record = DeadLetterRecord::new(message, "  ");
        assert_eq!(record.error_reason, "unknown error");
    }
}
