#![allow(dead_code)]

use async_trait::async_trait;
use order_relay::config::{Config, KafkaConfig, TopicsConfig};
use order_relay::events::{EventStore, InMemoryEventStore, OrderEvent};
use order_relay::kafka::profile::{ProfileCatalog, STANDARD};
use order_relay::kafka::{DeadLetterSink, LogTransport, MemoryLog};
use order_relay::{Error, Metrics, Result};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

pub const PRIMARY: &str = "order-events";
pub const SECONDARY: &str = "user-events";
pub const DLQ: &str = "dead-letter-queue";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("order_relay=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        client_id: format!("order-relay-test-{}", std::process::id()),
        admin_timeout_secs: 10,
    };

    // Unique topics per run so reruns never see old records
    let topics = TopicsConfig {
        primary: format!("test_{}_orders", std::process::id()),
        secondary: format!("test_{}_users", std::process::id()),
        dead_letter: format!("test_{}_dlq", std::process::id()),
        partitions: 3,
        replication_factor: env::var("TEST_KAFKA_REPLICATION")
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(1),
        ..TopicsConfig::default()
    };

    let mut config = Config {
        kafka,
        topics,
        ..Config::default()
    };
    config.consumer.group_id = format!("order-relay-test-{}", std::process::id());
    config.consumer.poll_timeout_ms = 200;
    config
}

/// A memory cluster with the default topics already created.
pub struct MemoryHarness {
    pub config: Config,
    pub log: MemoryLog,
    pub catalog: Arc<ProfileCatalog>,
    pub metrics: Metrics,
    pub dead_letters: Arc<DeadLetterSink>,
}

pub fn memory_harness() -> MemoryHarness {
    memory_harness_with_partitions(3)
}

/// Single-partition topics give a total order over produced records.
pub fn memory_harness_with_partitions(partitions: i32) -> MemoryHarness {
    let mut config = Config::default();
    config.topics.partitions = partitions;
    let log = MemoryLog::new();
    for spec in config.required_topics() {
        log.ensure_topic(&spec);
    }
    let catalog = Arc::new(ProfileCatalog::from_config(&config).unwrap());
    let metrics = Metrics::new().unwrap();
    let transport: Arc<dyn LogTransport> = Arc::new(log.clone());
    let dead_letters = Arc::new(DeadLetterSink::new(
        transport,
        catalog.producer_profile(STANDARD).unwrap().clone(),
        DLQ,
        metrics.clone(),
    ));

    MemoryHarness {
        config,
        log,
        catalog,
        metrics,
        dead_letters,
    }
}

pub fn order_json(order_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "orderId": order_id,
        "userId": "u1",
        "eventType": "CREATED",
        "orderStatus": "PENDING",
        "totalAmount": "10.00",
        "currency": "USD"
    }))
    .unwrap()
}

/// Event store that rejects saves for chosen order ids a number of times
/// before accepting them, and records when every save was attempted.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryEventStore,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` saves of `order_id` fail.
    pub fn fail(&self, order_id: &str, count: u32) {
        self.failures.lock().unwrap().insert(order_id.to_string(), count);
    }

    pub fn calls_for(&self, order_id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == order_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn accepted_writes(&self) -> u64 {
        self.inner.writes()
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn save(&self, event: &OrderEvent) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((event.order_id.clone(), Instant::now()));
        let failing = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&event.order_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if failing {
            return Err(Error::Store(format!("store unavailable for {}", event.order_id)));
        }
        self.inner.save(event).await
    }

    async fn find_all(&self) -> Result<Vec<OrderEvent>> {
        self.inner.find_all().await
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Vec<OrderEvent>> {
        self.inner.find_by_order_id(order_id).await
    }
}
