use crate::events::OrderEvent;
use crate::kafka::message::InboundRecord;
use crate::Result;
use serde_json::Value;

/// JSON codec for order events on the wire.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn to_value(event: &OrderEvent) -> Result<Value> {
        serde_json::to_value(event).map_err(Into::into)
    }

    pub fn deserialize(record: &InboundRecord) -> Result<OrderEvent> {
        serde_json::from_slice(&record.payload).map_err(Into::into)
    }
}
