//! Atomic multi-topic sends.
//!
//! A unit of work runs in a fixed order:
//!
//! 1. begin the log transaction
//! 2. stage every record
//! 3. `Participant::prepare`
//! 4. commit the log transaction
//! 5. `Participant::commit`
//!
//! Any failure up to and including step 4 aborts the log transaction, rolls
//! the participant back and returns [`Error::TransactionAbort`]. Readers
//! using `read_committed` never see records of an aborted unit.

use crate::events::{EventStore, OrderEvent};
use crate::kafka::transport::{Delivery, OutboundRecord, TransactionalLog};
use crate::metrics::Metrics;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// External work bound to the outcome of a log transaction.
#[async_trait]
pub trait Participant: Send {
    /// Last chance to refuse the unit before the log commits.
    async fn prepare(&mut self) -> Result<()>;

    /// Runs after the log transaction committed.
    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self);
}

/// Participant for units that only touch the log.
pub struct NoParticipant;

#[async_trait]
impl Participant for NoParticipant {
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) {}
}

/// Saves an order event once the log transaction has committed.
pub struct PersistEvent {
    store: Arc<dyn EventStore>,
    event: OrderEvent,
    saved: bool,
}

impl PersistEvent {
    pub fn new(store: Arc<dyn EventStore>, event: OrderEvent) -> Self {
        Self {
            store,
            event,
            saved: false,
        }
    }

    pub fn saved(&self) -> bool {
        self.saved
    }
}

#[async_trait]
impl Participant for PersistEvent {
    async fn prepare(&mut self) -> Result<()> {
        if self.event.order_id.trim().is_empty() {
            return Err(Error::Store("order event has no orderId".to_string()));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.store.save(&self.event).await?;
        self.saved = true;
        Ok(())
    }

    async fn rollback(&mut self) {
        debug!(order_id = %self.event.order_id, "Discarding order event of aborted transaction");
    }
}

/// Runs transactional units of work, one at a time, on a single
/// transactional producer.
pub struct TransactionCoordinator {
    log: Arc<dyn TransactionalLog>,
    in_flight: Mutex<()>,
    metrics: Metrics,
}

impl TransactionCoordinator {
    pub fn new(log: Arc<dyn TransactionalLog>, metrics: Metrics) -> Self {
        Self {
            log,
            in_flight: Mutex::new(()),
            metrics,
        }
    }

    /// A transactional id unique to this process instance.
    pub fn generate_transactional_id(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    pub fn transactional_id(&self) -> &str {
        self.log.transactional_id()
    }

    pub async fn execute(&self, records: Vec<OutboundRecord>) -> Result<Vec<Delivery>> {
        self.execute_with(records, &mut NoParticipant).await
    }

    pub async fn execute_with(
        &self,
        records: Vec<OutboundRecord>,
        participant: &mut dyn Participant,
    ) -> Result<Vec<Delivery>> {
        let _guard = self.in_flight.lock().await;
        let transactional_id = self.log.transactional_id().to_string();

        if let Err(e) = self.log.begin().await {
            participant.rollback().await;
            return Err(self.aborted(&transactional_id, format!("begin failed: {}", e)));
        }

        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            let topic = record.topic.clone();
            match self.log.send(record).await {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    let reason = format!("send to '{}' failed: {}", topic, e);
                    return Err(self.abort(&transactional_id, participant, reason).await);
                }
            }
        }

        if let Err(e) = participant.prepare().await {
            let reason = format!("participant refused to prepare: {}", e);
            return Err(self.abort(&transactional_id, participant, reason).await);
        }

        if let Err(e) = self.log.commit().await {
            let reason = format!("commit failed: {}", e);
            return Err(self.abort(&transactional_id, participant, reason).await);
        }

        if let Err(e) = participant.commit().await {
            self.metrics
                .transactions
                .with_label_values(&["participant_failed"])
                .inc();
            error!(
                transactional_id = %transactional_id,
                records = deliveries.len(),
                error = %e,
                "Log transaction committed but participant commit failed"
            );
            return Err(e);
        }

        self.metrics.transactions.with_label_values(&["committed"]).inc();
        info!(
            transactional_id = %transactional_id,
            records = deliveries.len(),
            "Transaction committed"
        );
        Ok(deliveries)
    }

    async fn abort(
        &self,
        transactional_id: &str,
        participant: &mut dyn Participant,
        reason: String,
    ) -> Error {
        if let Err(e) = self.log.abort().await {
            warn!(transactional_id = %transactional_id, error = %e, "Abort request failed");
        }
        participant.rollback().await;
        self.aborted(transactional_id, reason)
    }

    fn aborted(&self, transactional_id: &str, reason: String) -> Error {
        self.metrics.transactions.with_label_values(&["aborted"]).inc();
        warn!(transactional_id = %transactional_id, reason = %reason, "Transaction aborted");
        Error::TransactionAbort { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = TransactionCoordinator::generate_transactional_id("relay-tx");
        let b = TransactionCoordinator::generate_transactional_id("relay-tx");
        assert!(a.starts_with("relay-tx-"));
        assert_ne!(a, b);
    }
}
