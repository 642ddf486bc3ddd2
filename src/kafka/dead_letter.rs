use crate::kafka::message::DeadLetterRecord;
use crate::kafka::profile::DeliveryProfile;
use crate::kafka::transport::{Delivery, LogTransport, OutboundRecord};
use crate::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, info};

/// Result of the single dead-letter write attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterOutcome {
    Written(Delivery),
    Failed(String),
}

/// Best-effort writer for the dead-letter topic.
///
/// Each record gets exactly one write attempt. A failed write is logged
/// and counted, never retried and never itself dead-lettered.
pub struct DeadLetterSink {
    transport: Arc<dyn LogTransport>,
    profile: DeliveryProfile,
    topic: String,
    metrics: Metrics,
}

impl DeadLetterSink {
    /// `profile` supplies the producer the dead-letter writes go through.
    pub fn new(
        transport: Arc<dyn LogTransport>,
        profile: DeliveryProfile,
        topic: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            transport,
            profile,
            topic: topic.into(),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `origin` labels the metric: `producer` or the consumer profile name.
    pub async fn write(&self, record: DeadLetterRecord, origin: &str) -> DeadLetterOutcome {
        let outcome = self.attempt(&record).await;
        match &outcome {
            DeadLetterOutcome::Written(delivery) => {
                self.metrics
                    .dead_letter_writes
                    .with_label_values(&[origin, "written"])
                    .inc();
                info!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    key = %record.original.key_str(),
                    source_topic = %record.original.target_topic,
                    reason = %record.error_reason,
                    "Sent to dead-letter topic"
                );
            }
            DeadLetterOutcome::Failed(reason) => {
                self.metrics
                    .dead_letter_writes
                    .with_label_values(&[origin, "failed"])
                    .inc();
                error!(
                    topic = %self.topic,
                    key = %record.original.key_str(),
                    source_topic = %record.original.target_topic,
                    original_error = %record.error_reason,
                    error = %reason,
                    "Failed to write to dead-letter topic"
                );
            }
        }
        outcome
    }

    async fn attempt(&self, record: &DeadLetterRecord) -> DeadLetterOutcome {
        let payload = match serde_json::to_vec(&record.to_json()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return DeadLetterOutcome::Failed(e.to_string()),
        };
        let outbound = OutboundRecord {
            topic: self.topic.clone(),
            key: record.original.key.clone(),
            payload,
        };
        let delivery = match self.transport.enqueue(&self.profile, outbound) {
            Ok(future) => future.await,
            Err(e) => Err(e),
        };
        match delivery {
            Ok(delivery) => DeadLetterOutcome::Written(delivery),
            Err(e) => DeadLetterOutcome::Failed(e.to_string()),
        }
    }
}
