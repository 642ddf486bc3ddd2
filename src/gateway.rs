use crate::events::{EventStore, OrderEvent};
use crate::kafka::admin::{AdminSession, ClusterInfo, TopicDescription};
use crate::kafka::producer::{PublishOutcome, Publisher};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Entry points for callers outside the crate: submit an event under a
/// profile, read stored events back, and inspect the cluster.
pub struct OrderGateway {
    publisher: Arc<Publisher>,
    store: Arc<dyn EventStore>,
    admin: AdminSession,
}

impl OrderGateway {
    pub fn new(publisher: Arc<Publisher>, store: Arc<dyn EventStore>, admin: AdminSession) -> Self {
        Self {
            publisher,
            store,
            admin,
        }
    }

    /// Publishes `event` under `profile`. A rolled-back transaction comes
    /// back as `PublishOutcome::Aborted`; only an unknown profile or a
    /// misconfiguration is an error.
    pub async fn submit(&self, profile: &str, event: &OrderEvent) -> Result<PublishOutcome> {
        let outcome = match self.publisher.send_event(profile, event).await {
            Ok(outcome) => outcome,
            Err(Error::TransactionAbort { reason }) => PublishOutcome::Aborted { reason },
            Err(e) => return Err(e),
        };
        info!(profile, order_id = %event.order_id, outcome = ?outcome, "Order event submitted");
        Ok(outcome)
    }

    pub async fn list_all(&self) -> Result<Vec<OrderEvent>> {
        self.store.find_all().await
    }

    pub async fn list_by_order_id(&self, order_id: &str) -> Result<Vec<OrderEvent>> {
        self.store.find_by_order_id(order_id).await
    }

    /// Fails with `Error::AdminSessionClosed` outside an open topic session.
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.admin.client()?.describe_cluster().await
    }

    pub async fn topic_info(&self, names: &[String]) -> Result<Vec<TopicDescription>> {
        self.admin.client()?.describe_topics(names).await
    }
}
