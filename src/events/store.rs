use crate::events::OrderEvent;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Persistence capability the consumption pipelines write into.
///
/// `save` must be idempotent per event, identified by order id, event type
/// and update time: pipelines deliver at least once and replay whole batches
/// after a mid-batch failure. Distinct lifecycle events of one order are all
/// kept.
///
/// `find_by_order_id` returns an order's events in the order they were first
/// saved.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save(&self, event: &OrderEvent) -> Result<()>;

    async fn find_all(&self) -> Result<Vec<OrderEvent>>;

    async fn find_by_order_id(&self, order_id: &str) -> Result<Vec<OrderEvent>>;
}

/// Event store kept in process memory, grouped by order id.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<BTreeMap<String, Vec<OrderEvent>>>,
    writes: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls accepted, including overwrites.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Distinct events held, across all orders.
    pub async fn len(&self) -> usize {
        self.events.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(&self, event: &OrderEvent) -> Result<()> {
        let mut events = self.events.write().await;
        let history = events.entry(event.order_id.clone()).or_default();
        let replaced = match history.iter_mut().find(|e| same_event(e, event)) {
            Some(existing) => {
                *existing = event.clone();
                true
            }
            None => {
                history.push(event.clone());
                false
            }
        };
        drop(events);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(order_id = %event.order_id, replaced, "Stored order event");
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<OrderEvent>> {
        Ok(self.events.read().await.values().flatten().cloned().collect())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Vec<OrderEvent>> {
        Ok(self.events.read().await.get(order_id).cloned().unwrap_or_default())
    }
}

fn same_event(a: &OrderEvent, b: &OrderEvent) -> bool {
    a.event_type == b.event_type && a.updated_at == b.updated_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderEventType, OrderStatus};
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_redelivered_event_is_stored_once() {
        let store = InMemoryEventStore::new();
        let event = OrderEvent::created("o1", "u1");

        store.save(&event).await.unwrap();
        store.save(&event).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_order_history_keeps_every_lifecycle_event() {
        let store = InMemoryEventStore::new();
        let created = OrderEvent::created("o1", "u1");
        let mut paid = created.clone();
        paid.event_type = OrderEventType::Paid;
        paid.order_status = OrderStatus::Paid;

        store.save(&created).await.unwrap();
        store.save(&paid).await.unwrap();
        store.save(&paid).await.unwrap();

        let found = store.find_by_order_id("o1").await.unwrap();
        let types: Vec<OrderEventType> = found.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![OrderEventType::Created, OrderEventType::Paid]);
        assert_eq!(store.len().await, 2);
        assert!(store.find_by_order_id("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_event_updated_later_is_kept_separately() {
        let store = InMemoryEventStore::new();
        let mut first = OrderEvent::created("o1", "u1");
        first.event_type = OrderEventType::Updated;
        first.updated_at = NaiveDate::from_ymd_opt(2024, 3, 1).and_then(|d| d.and_hms_opt(10, 0, 0));
        let mut second = first.clone();
        second.updated_at = NaiveDate::from_ymd_opt(2024, 3, 1).and_then(|d| d.and_hms_opt(11, 0, 0));

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.find_by_order_id("o1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_find_all_is_ordered_by_order_id() {
        let store = InMemoryEventStore::new();
        for id in ["o3", "o1", "o2"] {
            store.save(&OrderEvent::created(id, "u")).await.unwrap();
        }
        let ids: Vec<String> = store
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.order_id)
            .collect();
        assert_eq!(ids, vec!["o1", "o2", "o3"]);
    }
}
