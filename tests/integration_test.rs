mod common;

use common::*;
use order_relay::config::Config;
use order_relay::events::{EventStore, InMemoryEventStore, OrderEvent};
use order_relay::kafka::profile::{ProfileCatalog, HIGH_THROUGHPUT, RELIABLE, TRANSACTIONAL};
use order_relay::kafka::{KafkaAdminConnector, PublishOutcome, TopicLifecycleManager, TopicStatus};
use order_relay::{Backend, Metrics, Relay};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn admin_for(config: &Config) -> TopicLifecycleManager {
    TopicLifecycleManager::open(&KafkaAdminConnector::from_config(config), config.topics.drift_policy).unwrap()
}

async fn drop_topics(config: &Config) {
    let topics = admin_for(config);
    for spec in config.required_topics() {
        topics.delete_topic_if_exists(&spec.name).await.ok();
    }
    topics.close();
}

#[tokio::test]
#[ignore] // Requires running Kafka
async fn test_topic_reconciliation_is_idempotent() {
    init_tracing();
    let config = get_test_config();
    let topics = admin_for(&config);
    let spec = &config.required_topics()[0];

    let first = topics.create_topic_if_not_exists(spec).await.unwrap();
    let second = topics.create_topic_if_not_exists(spec).await.unwrap();
    assert_eq!(first, TopicStatus::Created);
    assert_eq!(second, TopicStatus::Verified);

    let description = topics.describe_topic(&spec.name).await.unwrap().unwrap();
    assert_eq!(description.partition_count(), spec.partitions);

    let cluster = topics.describe_cluster().await.unwrap();
    assert!(!cluster.brokers.is_empty());

    assert!(topics.delete_topic_if_exists(&spec.name).await.unwrap());
    topics.close();
}

#[tokio::test]
#[ignore] // Requires running Kafka
async fn test_end_to_end_relay() {
    init_tracing();
    let mut config = get_test_config();
    config.consumer.profiles = vec!["standard".to_string()];
    let catalog = Arc::new(ProfileCatalog::from_config(&config).unwrap());
    let backend = Backend::kafka(&config, &catalog).await.unwrap();
    let store = Arc::new(InMemoryEventStore::new());
    let relay = Relay::new(config.clone(), catalog, backend, store.clone(), Metrics::new().unwrap()).unwrap();
    let shutdown = CancellationToken::new();

    let driver = async {
        // Give the relay time to reconcile topics and join the group
        tokio::time::sleep(Duration::from_secs(5)).await;
        let gateway = relay.gateway();

        let reliable = gateway
            .submit(RELIABLE, &OrderEvent::created("it-reliable", "u1"))
            .await
            .unwrap();
        assert!(reliable.is_delivered());

        let transactional = gateway
            .submit(TRANSACTIONAL, &OrderEvent::created("it-tx", "u1"))
            .await
            .unwrap();
        assert!(transactional.is_delivered(), "unexpected outcome: {:?}", transactional);

        let deadline = Instant::now() + Duration::from_secs(30);
        while store.len().await < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        shutdown.cancel();
    };

    let (result, _) = tokio::join!(relay.run(shutdown.clone()), driver);
    result.unwrap();

    assert_eq!(store.find_by_order_id("it-reliable").await.unwrap().len(), 1);
    assert_eq!(store.find_by_order_id("it-tx").await.unwrap().len(), 1);

    drop_topics(&config).await;
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_high_throughput_publish
async fn test_high_throughput_publish() {
    init_tracing();
    let config = get_test_config();
    let catalog = Arc::new(ProfileCatalog::from_config(&config).unwrap());
    let backend = Backend::kafka(&config, &catalog).await.unwrap();
    let relay = Relay::new(
        config.clone(),
        catalog,
        backend,
        Arc::new(InMemoryEventStore::new()),
        Metrics::new().unwrap(),
    )
    .unwrap();
    let (topics, _) = relay.prepare().await.unwrap();
    let publisher = relay.publisher();

    let target_messages = 10_000;
    let start_time = Instant::now();
    info!("Starting throughput test with {} messages", target_messages);

    for i in 0..target_messages {
        let event = OrderEvent::created(format!("perf-{}", i), "u1");
        let outcome = publisher.send_event(HIGH_THROUGHPUT, &event).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Delivered(_)));
    }
    publisher.flush(Duration::from_secs(60)).await.unwrap();

    let elapsed = start_time.elapsed();
    let rate = target_messages as f64 / elapsed.as_secs_f64();
    info!(elapsed_ms = elapsed.as_millis() as u64, rate, "Throughput test finished");

    assert_eq!(
        relay
            .metrics()
            .publish_outcomes
            .with_label_values(&[HIGH_THROUGHPUT, "delivered"])
            .get(),
        target_messages
    );
    topics.close();
    drop_topics(&config).await;
}
