mod common;

use common::*;
use order_relay::config::{Config, DriftPolicy};
use order_relay::events::{EventStore, InMemoryEventStore, OrderEvent};
use order_relay::kafka::profile::{ProfileCatalog, RELIABLE, STANDARD, TRANSACTIONAL};
use order_relay::kafka::{Ack, MemoryLog, PublishOutcome, TopicSpec};
use order_relay::{Backend, Error, Metrics, Relay};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn relay_config() -> Config {
    let mut config = Config::default();
    config.consumer.profiles = vec![STANDARD.to_string()];
    config.consumer.poll_timeout_ms = 100;
    config
}

fn build(config: Config, log: &MemoryLog, store: Arc<InMemoryEventStore>) -> Relay {
    let catalog = Arc::new(ProfileCatalog::from_config(&config).unwrap());
    Relay::new(config, catalog, Backend::memory(log), store, Metrics::new().unwrap()).unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_relay_publishes_and_consumes() {
    init_tracing();
    let log = MemoryLog::new();
    let store = Arc::new(InMemoryEventStore::new());
    let relay = build(relay_config(), &log, store.clone());
    let shutdown = CancellationToken::new();

    let driver = async {
        wait_until(|| log.topic_creations() == 3).await;

        let outcome = relay
            .gateway()
            .submit(RELIABLE, &OrderEvent::created("r1", "u1"))
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Delivered(Ack::Acknowledged(_))));

        for _ in 0..500 {
            if !store.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
    };

    let (result, _) = tokio::join!(relay.run(shutdown.clone()), driver);
    let reports = result.unwrap();

    assert_eq!(reports.iter().map(|r| r.processed).sum::<u64>(), 1);
    let stored = relay.gateway().list_by_order_id("r1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].user_id, "u1");
}

#[tokio::test]
async fn test_transactional_submit_reaches_both_topics() {
    let log = MemoryLog::new();
    let relay = build(relay_config(), &log, Arc::new(InMemoryEventStore::new()));
    let (topics, report) = relay.prepare().await.unwrap();
    assert_eq!(report.created.len(), 3);

    let outcome = relay
        .gateway()
        .submit(TRANSACTIONAL, &OrderEvent::created("t1", "u1"))
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Delivered(Ack::Committed(ref d)) if d.len() == 2));
    assert_eq!(log.records(PRIMARY).len(), 1);
    assert_eq!(log.records(SECONDARY).len(), 1);
    topics.close();
}

#[tokio::test]
async fn test_gateway_folds_abort_into_outcome() {
    let log = MemoryLog::new();
    let relay = build(relay_config(), &log, Arc::new(InMemoryEventStore::new()));
    let (topics, _) = relay.prepare().await.unwrap();
    log.fail_transaction_send_at(1);

    let outcome = relay
        .gateway()
        .submit(TRANSACTIONAL, &OrderEvent::created("t2", "u1"))
        .await
        .unwrap();

    assert!(matches!(outcome, PublishOutcome::Aborted { .. }));
    assert!(log.records(PRIMARY).is_empty());
    assert!(log.records(SECONDARY).is_empty());
    assert_eq!(
        relay
            .metrics()
            .publish_outcomes
            .with_label_values(&[TRANSACTIONAL, "aborted"])
            .get(),
        1
    );
    topics.close();
}

#[tokio::test]
async fn test_aborted_records_are_never_consumed() {
    let log = MemoryLog::new();
    let store = Arc::new(InMemoryEventStore::new());
    let relay = build(relay_config(), &log, store.clone());
    let shutdown = CancellationToken::new();

    let driver = async {
        wait_until(|| log.topic_creations() == 3).await;
        let gateway = relay.gateway();

        log.fail_transaction_commit();
        let aborted = gateway
            .submit(TRANSACTIONAL, &OrderEvent::created("gone", "u1"))
            .await
            .unwrap();
        assert!(matches!(aborted, PublishOutcome::Aborted { .. }));

        gateway
            .submit(RELIABLE, &OrderEvent::created("kept", "u1"))
            .await
            .unwrap();

        for _ in 0..500 {
            if !store.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // give the consumer a chance to see anything it should not
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
    };

    let (result, _) = tokio::join!(relay.run(shutdown.clone()), driver);
    result.unwrap();

    assert_eq!(log.raw_len(PRIMARY), 2);
    let ids: Vec<String> = store
        .find_all()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.order_id)
        .collect();
    assert_eq!(ids, vec!["kept".to_string()]);
}

#[tokio::test]
async fn test_fail_fast_drift_stops_startup() {
    let log = MemoryLog::new();
    log.ensure_topic(&TopicSpec::new(PRIMARY, 1, 1));
    let mut config = relay_config();
    config.topics.drift_policy = DriftPolicy::FailFast;
    let relay = build(config, &log, Arc::new(InMemoryEventStore::new()));

    let result = relay.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::TopicDrift(drift)) if drift.topic == PRIMARY));
}

#[tokio::test]
async fn test_warn_drift_still_runs() {
    let log = MemoryLog::new();
    log.ensure_topic(&TopicSpec::new(PRIMARY, 1, 1));
    let relay = build(relay_config(), &log, Arc::new(InMemoryEventStore::new()));

    let (topics, report) = relay.prepare().await.unwrap();
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.created.len(), 2);
    topics.close();
}

#[tokio::test]
async fn test_gateway_cluster_introspection() {
    let log = MemoryLog::new();
    let relay = build(relay_config(), &log, Arc::new(InMemoryEventStore::new()));
    let (topics, _) = relay.prepare().await.unwrap();
    let gateway = relay.gateway();

    let cluster = gateway.cluster_info().await.unwrap();
    assert_eq!(cluster.brokers.len(), 1);
    assert!(cluster.cluster_id.is_some());

    let described = gateway
        .topic_info(&[PRIMARY.to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(described.len(), 1);
    assert_eq!(described[0].partition_count(), 3);
    assert_eq!(described[0].replication_factor(), 3);
    topics.close();
}

#[tokio::test]
async fn test_gateway_introspection_ends_with_the_session() {
    let log = MemoryLog::new();
    let relay = build(relay_config(), &log, Arc::new(InMemoryEventStore::new()));
    let gateway = relay.gateway();
    assert!(matches!(gateway.cluster_info().await, Err(Error::AdminSessionClosed)));

    let (topics, _) = relay.prepare().await.unwrap();
    assert!(gateway.cluster_info().await.is_ok());

    topics.close();
    assert!(matches!(gateway.cluster_info().await, Err(Error::AdminSessionClosed)));
    assert!(matches!(
        gateway.topic_info(&[PRIMARY.to_string()]).await,
        Err(Error::AdminSessionClosed)
    ));

    // a later session serves the same gateway again
    let (topics, _) = relay.prepare().await.unwrap();
    assert_eq!(gateway.cluster_info().await.unwrap().brokers.len(), 1);
    topics.close();
    assert_eq!(log.admin_connections(), 2);
}

#[tokio::test]
async fn test_unknown_consumer_profile_fails_run() {
    let log = MemoryLog::new();
    let mut config = relay_config();
    config.consumer.profiles = vec!["nightly".to_string()];
    let relay = build(config, &log, Arc::new(InMemoryEventStore::new()));

    let result = relay.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::UnknownProfile { name }) if name == "nightly"));
}
