use crate::config::TopicsConfig;
use crate::events::OrderEvent;
use crate::kafka::dead_letter::{DeadLetterOutcome, DeadLetterSink};
use crate::kafka::key_strategy::KeyStrategy;
use crate::kafka::message::{DeadLetterRecord, Message, Payload};
use crate::kafka::profile::{DeliveryProfile, ProfileCatalog};
use crate::kafka::serializer::JsonSerializer;
use crate::kafka::transaction::TransactionCoordinator;
use crate::kafka::transport::{Delivery, LogTransport, OutboundRecord};
use crate::metrics::Metrics;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How far a delivered message got before `send` returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// Accepted into the local producer buffer. The acknowledgment is
    /// observed in the background and a late failure is dead-lettered.
    Queued { topic: String },
    /// Acknowledged by the broker at the profile's acks level.
    Acknowledged(Delivery),
    /// Committed as part of a transaction, one delivery per target topic.
    Committed(Vec<Delivery>),
}

/// Result of one publish call. Every call ends in exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Delivered(Ack),
    /// Delivery failed and a dead-letter record was written.
    DeadLettered { reason: String },
    /// The message was lost: it could not be serialized, or both delivery
    /// and the dead-letter write failed.
    Dropped { reason: String },
    /// A transactional unit rolled back. `Publisher::send` surfaces this as
    /// `Error::TransactionAbort`; callers that fold errors into outcomes use it.
    Aborted { reason: String },
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered(_))
    }

    fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Delivered(Ack::Queued { .. }) => "queued",
            PublishOutcome::Delivered(_) => "delivered",
            PublishOutcome::DeadLettered { .. } => "dead_lettered",
            PublishOutcome::Dropped { .. } => "dropped",
            PublishOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Sends messages under named delivery profiles.
///
/// Non-transactional profiles never return a transport failure: a message
/// that cannot be delivered is written once to the dead-letter topic. The
/// transactional profile returns `Error::TransactionAbort` instead so the
/// caller's unit of work can roll back.
pub struct Publisher {
    catalog: Arc<ProfileCatalog>,
    transport: Arc<dyn LogTransport>,
    dead_letters: Arc<DeadLetterSink>,
    coordinator: Option<Arc<TransactionCoordinator>>,
    topics: TopicsConfig,
    key_strategy: KeyStrategy,
    metrics: Metrics,
    background: TaskTracker,
}

impl Publisher {
    pub fn new(
        catalog: Arc<ProfileCatalog>,
        transport: Arc<dyn LogTransport>,
        dead_letters: Arc<DeadLetterSink>,
        topics: TopicsConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            catalog,
            transport,
            dead_letters,
            coordinator: None,
            topics,
            key_strategy: KeyStrategy::default(),
            metrics,
            background: TaskTracker::new(),
        }
    }

    /// Enables the transactional profile.
    pub fn with_coordinator(mut self, coordinator: Arc<TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    /// Publishes an order event keyed by the configured key strategy.
    pub async fn send_event(&self, profile: &str, event: &OrderEvent) -> Result<PublishOutcome> {
        match JsonSerializer::to_value(event) {
            Ok(value) => {
                let key = self.key_strategy.extract_key(&value);
                self.publish(profile, key, Payload::Json(value)).await
            }
            Err(e) => {
                let profile = self.catalog.producer_profile(profile)?;
                self.metrics
                    .publish_attempts
                    .with_label_values(&[&profile.name])
                    .inc();
                Ok(self.finish(profile, &event.order_id, PublishOutcome::Dropped {
                    reason: e.to_string(),
                }))
            }
        }
    }

    pub async fn send(
        &self,
        profile: &str,
        key: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<PublishOutcome> {
        self.publish(profile, Some(key.into()), payload.into()).await
    }

    async fn publish(&self, profile: &str, key: Option<String>, payload: Payload) -> Result<PublishOutcome> {
        let profile = self.catalog.producer_profile(profile)?;

        self.metrics
            .publish_attempts
            .with_label_values(&[&profile.name])
            .inc();

        if profile.transactional {
            return self.send_transactional(profile, key, payload).await;
        }

        let role = profile.targets.first().ok_or_else(|| Error::InvalidProfile {
            name: profile.name.clone(),
            reason: "profile has no target topic".to_string(),
        })?;
        let topic = self.topics.name_for(*role).to_string();
        let message = Message::new(key, payload, topic, profile.name.clone());
        debug!(profile = %profile.name, topic = %message.target_topic, key = %message.key_str(), "Publishing message");

        let bytes = match message.payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(self.finish(profile, message.key_str(), PublishOutcome::Dropped {
                    reason: e.to_string(),
                }))
            }
        };
        let record = OutboundRecord {
            topic: message.target_topic.clone(),
            key: message.key.clone(),
            payload: bytes,
        };

        let future = match self.transport.enqueue(profile, record) {
            Ok(future) => future,
            Err(e) => {
                let outcome = dead_letter(&self.dead_letters, message.clone(), e.to_string()).await;
                return Ok(self.finish(profile, message.key_str(), outcome));
            }
        };

        if profile.await_ack {
            let outcome = match future.await {
                Ok(delivery) => PublishOutcome::Delivered(Ack::Acknowledged(delivery)),
                Err(e) => dead_letter(&self.dead_letters, message.clone(), e.to_string()).await,
            };
            return Ok(self.finish(profile, message.key_str(), outcome));
        }

        let dead_letters = Arc::clone(&self.dead_letters);
        let metrics = self.metrics.clone();
        let queued = PublishOutcome::Delivered(Ack::Queued {
            topic: message.target_topic.clone(),
        });
        let outcome = self.finish(profile, message.key_str(), queued);

        self.background.spawn(async move {
            let late = match future.await {
                Ok(delivery) => {
                    debug!(
                        profile = %message.profile,
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Queued message acknowledged"
                    );
                    PublishOutcome::Delivered(Ack::Acknowledged(delivery))
                }
                Err(e) => dead_letter(&dead_letters, message.clone(), e.to_string()).await,
            };
            metrics
                .publish_outcomes
                .with_label_values(&[&message.profile, late.label()])
                .inc();
        });

        Ok(outcome)
    }

    /// Waits for every queued send to be acknowledged or dead-lettered.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || transport.flush(timeout))
            .await
            .map_err(|e| Error::transport("", e))??;

        self.background.close();
        self.background.wait().await;
        self.background.reopen();
        Ok(())
    }

    async fn send_transactional(
        &self,
        profile: &DeliveryProfile,
        key: Option<String>,
        payload: Payload,
    ) -> Result<PublishOutcome> {
        let key_str = key.as_deref().unwrap_or_default();
        let coordinator = self.coordinator.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "profile '{}' needs transactions, which are disabled",
                profile.name
            ))
        })?;

        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(self.finish(profile, key_str, PublishOutcome::Dropped {
                    reason: e.to_string(),
                }))
            }
        };
        let records = profile
            .targets
            .iter()
            .map(|role| OutboundRecord {
                topic: self.topics.name_for(*role).to_string(),
                key: key.clone(),
                payload: bytes.clone(),
            })
            .collect();

        match coordinator.execute(records).await {
            Ok(deliveries) => Ok(self.finish(
                profile,
                key_str,
                PublishOutcome::Delivered(Ack::Committed(deliveries)),
            )),
            Err(e) => {
                self.metrics
                    .publish_outcomes
                    .with_label_values(&[&profile.name, "aborted"])
                    .inc();
                warn!(profile = %profile.name, key = %key_str, error = %e, "Transactional publish aborted");
                Err(e)
            }
        }
    }

    fn finish(&self, profile: &DeliveryProfile, key: &str, outcome: PublishOutcome) -> PublishOutcome {
        self.metrics
            .publish_outcomes
            .with_label_values(&[&profile.name, outcome.label()])
            .inc();
        match &outcome {
            PublishOutcome::Delivered(Ack::Acknowledged(d)) => info!(
                profile = %profile.name,
                key = %key,
                topic = %d.topic,
                partition = d.partition,
                offset = d.offset,
                "Message delivered"
            ),
            PublishOutcome::Delivered(Ack::Committed(deliveries)) => info!(
                profile = %profile.name,
                key = %key,
                records = deliveries.len(),
                "Message committed"
            ),
            PublishOutcome::Delivered(Ack::Queued { topic }) => {
                debug!(profile = %profile.name, key = %key, topic = %topic, "Message queued")
            }
            PublishOutcome::DeadLettered { reason } => {
                warn!(profile = %profile.name, key = %key, reason = %reason, "Message dead-lettered")
            }
            PublishOutcome::Dropped { reason } | PublishOutcome::Aborted { reason } => {
                warn!(profile = %profile.name, key = %key, reason = %reason, "Message dropped")
            }
        }
        outcome
    }
}

async fn dead_letter(sink: &DeadLetterSink, message: Message, reason: String) -> PublishOutcome {
    warn!(
        profile = %message.profile,
        topic = %message.target_topic,
        key = %message.key_str(),
        error = %reason,
        "Delivery failed, falling back to dead-letter topic"
    );
    match sink.write(DeadLetterRecord::new(message, reason.clone()), "producer").await {
        DeadLetterOutcome::Written(_) => PublishOutcome::DeadLettered { reason },
        DeadLetterOutcome::Failed(dlq_error) => PublishOutcome::Dropped {
            reason: format!("{}; dead-letter write failed: {}", reason, dlq_error),
        },
    }
}
