use serde_json::Value;
use tracing::{debug, warn};

/// How a message key is derived from an event payload.
///
/// The key decides the partition, so every event of one order must map to
/// the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The `orderId` field.
    #[default]
    OrderId,
    /// A dotted path into the payload, e.g. `customer.id`.
    FieldPath(String),
    /// Several fields joined with `:`.
    Composite(Vec<String>),
    /// No key; the producer spreads records across partitions.
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, payload: &Value) -> Option<String> {
        match self {
            KeyStrategy::OrderId => {
                let key = extract_field_value(payload, "orderId");
                if key.is_none() {
                    warn!("Payload has no orderId to key on");
                }
                key
            }
            KeyStrategy::FieldPath(path) => extract_field_value(payload, path),
            KeyStrategy::Composite(fields) => extract_composite_key(payload, fields),
            KeyStrategy::None => None,
        }
    }
}

fn extract_field_value(record: &Value, field_path: &str) -> Option<String> {
    let mut current = record;

    for part in field_path.split('.') {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in payload", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => Some(current.to_string()),
    }
}

fn extract_composite_key(record: &Value, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        match extract_field_value(record, field) {
            Some(value) => key_parts.push(value),
            None => {
                debug!("Missing field '{}' for composite key", field);
                return None;
            }
        }
    }

    if key_parts.is_empty() {
        None
    } else {
        Some(key_parts.join(":"))
    }
}
