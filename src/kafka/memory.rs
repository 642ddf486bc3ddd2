//! In-process log service for tests and dry runs.
//!
//! [`MemoryLog`] implements every transport seam: plain sends, one
//! transactional producer, the admin protocol and consumer-group sources.
//! Records written inside a transaction stay invisible to sources until the
//! transaction commits and are skipped for good if it aborts, matching
//! `read_committed` consumers. Failures can be injected per topic and per
//! operation.

use crate::kafka::admin::{
    AdminApi, AdminConnector, BrokerInfo, ClusterInfo, PartitionInfo, TopicDescription,
};
use crate::kafka::consumer::{Position, RecordSource, RecordSourceFactory};
use crate::kafka::message::{InboundRecord, TopicSpec};
use crate::kafka::profile::{ConsumerProfile, DeliveryProfile};
use crate::kafka::transport::{
    Delivery, DeliveryFuture, LogTransport, OutboundRecord, TransactionalLog,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Group id base used by in-memory sources.
pub const GROUP_BASE: &str = "memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Committed,
    Pending,
    Aborted,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Bytes,
    visibility: Visibility,
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    replication_factor: i32,
}

#[derive(Debug, Default)]
struct Failures {
    sends: HashMap<String, u32>,
    transaction_send_at: Option<usize>,
    transaction_commit: bool,
    commits: u32,
    admin: bool,
}

#[derive(Debug, Default)]
struct State {
    topics: BTreeMap<String, TopicLog>,
    /// Committed next offsets per (group, topic, partition).
    offsets: HashMap<(String, String, i32), i64>,
    send_attempts: HashMap<String, u32>,
    topic_creations: u32,
    admin_connections: u32,
    /// Locations staged by the open transaction, if any.
    transaction: Option<Vec<(String, i32, usize)>>,
    round_robin: usize,
    failures: Failures,
}

struct Shared {
    state: Mutex<State>,
    appended: Notify,
    transactional_id: String,
}

/// Cheaply cloneable handle to one in-memory cluster.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_transactional_id("memory-tx")
    }

    pub fn with_transactional_id(transactional_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                transactional_id: transactional_id.into(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the topic unless it exists. Existing topics keep their shape.
    pub fn ensure_topic(&self, spec: &TopicSpec) {
        let mut state = self.state();
        if !state.topics.contains_key(&spec.name) {
            state.topics.insert(
                spec.name.clone(),
                TopicLog {
                    partitions: vec![Vec::new(); spec.partitions.max(1) as usize],
                    replication_factor: spec.replication_factor,
                },
            );
            state.topic_creations += 1;
        }
    }

    /// Appends a committed record outside any producer, as an external
    /// writer would.
    pub fn produce(&self, topic: &str, key: Option<&str>, payload: impl Into<Bytes>) -> Result<Delivery> {
        let mut state = self.state();
        let delivery = append(
            &mut state,
            topic,
            key.map(str::to_string),
            payload.into(),
            Visibility::Committed,
        )?;
        drop(state);
        self.shared.appended.notify_waiters();
        Ok(delivery)
    }

    /// Committed records of a topic, in partition then offset order.
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        let state = self.state();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let visible = log
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.visibility == Visibility::Committed)
                    .map(move |(offset, r)| InboundRecord {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: offset as i64,
                        key: r.key.clone(),
                        payload: r.payload.clone(),
                    })
            })
            .collect();
        visible
    }

    /// Every record ever appended to a topic, whatever its transaction state.
    pub fn raw_len(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Producer attempts against a topic, counting transport retries.
    pub fn send_attempts(&self, topic: &str) -> u32 {
        self.state().send_attempts.get(topic).copied().unwrap_or(0)
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn topic_creations(&self) -> u32 {
        self.state().topic_creations
    }

    /// Admin clients handed out so far, one per opened session.
    pub fn admin_connections(&self) -> u32 {
        self.state().admin_connections
    }

    /// The next `count` send attempts to `topic` fail.
    pub fn fail_sends(&self, topic: &str, count: u32) {
        self.state().failures.sends.insert(topic.to_string(), count);
    }

    /// The `n`th send (0-based) of the next transaction fails.
    pub fn fail_transaction_send_at(&self, n: usize) {
        self.state().failures.transaction_send_at = Some(n);
    }

    pub fn fail_transaction_commit(&self) {
        self.state().failures.transaction_commit = true;
    }

    /// The next `count` offset commits fail.
    pub fn fail_commits(&self, count: u32) {
        self.state().failures.commits = count;
    }

    /// While set, every admin call times out.
    pub fn fail_admin(&self, failing: bool) {
        self.state().failures.admin = failing;
    }

    fn check_admin(&self, operation: &str) -> Result<()> {
        if self.state().failures.admin {
            return Err(Error::AdminTimeout {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

fn partition_for(state: &mut State, key: Option<&str>, partitions: usize) -> usize {
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        _ => {
            state.round_robin = state.round_robin.wrapping_add(1);
            state.round_robin % partitions
        }
    }
}

fn append(
    state: &mut State,
    topic: &str,
    key: Option<String>,
    payload: Bytes,
    visibility: Visibility,
) -> Result<Delivery> {
    let partitions = match state.topics.get(topic) {
        Some(log) => log.partitions.len(),
        None => return Err(Error::transport(topic, "unknown topic")),
    };
    let partition = partition_for(state, key.as_deref(), partitions);
    let log = state
        .topics
        .get_mut(topic)
        .ok_or_else(|| Error::transport(topic, "unknown topic"))?;
    let records = &mut log.partitions[partition];
    records.push(StoredRecord {
        key,
        payload,
        visibility,
    });
    Ok(Delivery {
        topic: topic.to_string(),
        partition: partition as i32,
        offset: (records.len() - 1) as i64,
    })
}

/// Counts one attempt and reports whether an injected failure consumed it.
fn injected_send_failure(state: &mut State, topic: &str) -> bool {
    *state.send_attempts.entry(topic.to_string()).or_insert(0) += 1;
    match state.failures.sends.get_mut(topic) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl LogTransport for MemoryLog {
    fn enqueue(&self, profile: &DeliveryProfile, record: OutboundRecord) -> Result<DeliveryFuture> {
        let mut state = self.state();
        let mut attempt = 0;
        let result = loop {
            if !injected_send_failure(&mut state, &record.topic) {
                break append(
                    &mut state,
                    &record.topic,
                    record.key.clone(),
                    record.payload.clone(),
                    Visibility::Committed,
                );
            }
            debug!(topic = %record.topic, attempt, "Injected send failure");
            if attempt >= profile.max_retries {
                break Err(Error::transport(
                    &record.topic,
                    format!("broker unavailable after {} attempts", attempt + 1),
                ));
            }
            attempt += 1;
        };
        drop(state);
        if result.is_ok() {
            self.shared.appended.notify_waiters();
        }
        Ok(futures::future::ready(result).boxed())
    }
}

#[async_trait]
impl TransactionalLog for MemoryLog {
    fn transactional_id(&self) -> &str {
        &self.shared.transactional_id
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state();
        if state.transaction.is_some() {
            return Err(Error::TransactionAbort {
                reason: "a transaction is already open".to_string(),
            });
        }
        state.transaction = Some(Vec::new());
        Ok(())
    }

    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        let mut state = self.state();
        let staged = match &state.transaction {
            Some(staged) => staged.len(),
            None => return Err(Error::transport(&record.topic, "no open transaction")),
        };
        if state.failures.transaction_send_at == Some(staged) {
            state.failures.transaction_send_at = None;
            *state.send_attempts.entry(record.topic.clone()).or_insert(0) += 1;
            return Err(Error::transport(&record.topic, "injected transactional send failure"));
        }
        if injected_send_failure(&mut state, &record.topic) {
            return Err(Error::transport(&record.topic, "broker unavailable"));
        }
        let delivery = append(
            &mut state,
            &record.topic,
            record.key,
            record.payload,
            Visibility::Pending,
        )?;
        if let Some(staged) = state.transaction.as_mut() {
            staged.push((delivery.topic.clone(), delivery.partition, delivery.offset as usize));
        }
        Ok(delivery)
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state();
        if state.failures.transaction_commit {
            state.failures.transaction_commit = false;
            return Err(Error::transport("", "injected commit failure"));
        }
        finish_transaction(&mut state, Visibility::Committed)?;
        drop(state);
        self.shared.appended.notify_waiters();
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        finish_transaction(&mut self.state(), Visibility::Aborted)
    }
}

fn finish_transaction(state: &mut State, visibility: Visibility) -> Result<()> {
    let staged = state.transaction.take().ok_or_else(|| Error::TransactionAbort {
        reason: "no open transaction".to_string(),
    })?;
    for (topic, partition, offset) in staged {
        if let Some(record) = state
            .topics
            .get_mut(&topic)
            .and_then(|log| log.partitions.get_mut(partition as usize))
            .and_then(|records| records.get_mut(offset))
        {
            record.visibility = visibility;
        }
    }
    Ok(())
}

impl AdminConnector for MemoryLog {
    fn connect(&self) -> Result<Arc<dyn AdminApi>> {
        self.state().admin_connections += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl AdminApi for MemoryLog {
    async fn describe_cluster(&self) -> Result<ClusterInfo> {
        self.check_admin("describe_cluster")?;
        Ok(ClusterInfo {
            cluster_id: Some("memory-cluster".to_string()),
            controller_id: Some(0),
            brokers: vec![BrokerInfo {
                id: 0,
                host: "localhost".to_string(),
                port: 9092,
            }],
        })
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        self.check_admin("list_topics")?;
        Ok(self.state().topics.keys().cloned().collect())
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<()> {
        self.check_admin("create_topics")?;
        for spec in specs {
            self.ensure_topic(spec);
        }
        Ok(())
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>> {
        self.check_admin("describe_topics")?;
        let state = self.state();
        let descriptions = names
            .iter()
            .filter_map(|name| {
                state.topics.get(name).map(|log| TopicDescription {
                    name: name.clone(),
                    partitions: (0..log.partitions.len() as i32)
                        .map(|id| PartitionInfo {
                            id,
                            leader: 0,
                            replicas: (0..log.replication_factor).collect(),
                            isr: (0..log.replication_factor).collect(),
                        })
                        .collect(),
                })
            })
            .collect();
        Ok(descriptions)
    }

    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        self.check_admin("delete_topics")?;
        let mut state = self.state();
        for name in names {
            state.topics.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSourceFactory for MemoryLog {
    async fn create(
        &self,
        profile: &ConsumerProfile,
        topics: &[String],
        worker: usize,
    ) -> Result<Box<dyn RecordSource>> {
        Ok(Box::new(MemorySource {
            log: self.clone(),
            group: profile.group_id(GROUP_BASE),
            topics: topics.to_vec(),
            worker,
            members: profile.concurrency.max(1),
            positions: HashMap::new(),
        }))
    }
}

/// Group member reading the partitions `p` with `p % members == worker`.
struct MemorySource {
    log: MemoryLog,
    group: String,
    topics: Vec<String>,
    worker: usize,
    members: usize,
    positions: HashMap<(String, i32), i64>,
}

impl MemorySource {
    fn fetch(&mut self, max: usize) -> Vec<InboundRecord> {
        let state = self.log.state();
        let mut records = Vec::new();

        for topic in &self.topics {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            for (partition, stored) in log.partitions.iter().enumerate() {
                if partition % self.members != self.worker {
                    continue;
                }
                let partition = partition as i32;
                let key = (topic.clone(), partition);
                let mut position = match self.positions.get(&key) {
                    Some(p) => *p,
                    None => state
                        .offsets
                        .get(&(self.group.clone(), topic.clone(), partition))
                        .copied()
                        .unwrap_or(0),
                };

                while records.len() < max {
                    let Some(record) = stored.get(position as usize) else {
                        break;
                    };
                    match record.visibility {
                        // Nothing past an open transaction is readable yet.
                        Visibility::Pending => break,
                        Visibility::Aborted => {}
                        Visibility::Committed => records.push(InboundRecord {
                            topic: topic.clone(),
                            partition,
                            offset: position,
                            key: record.key.clone(),
                            payload: record.payload.clone(),
                        }),
                    }
                    position += 1;
                }
                self.positions.insert(key, position);
            }
        }
        records
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<InboundRecord>> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.log.shared);
        loop {
            let notified = shared.appended.notified();
            let records = self.fetch(max);
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, positions: &[Position]) -> Result<()> {
        let mut state = self.log.state();
        if state.failures.commits > 0 {
            state.failures.commits -= 1;
            return Err(Error::transport("", "injected offset commit failure"));
        }
        for p in positions {
            state
                .offsets
                .insert((self.group.clone(), p.topic.clone(), p.partition), p.offset);
        }
        Ok(())
    }

    async fn seek(&mut self, positions: &[Position]) -> Result<()> {
        for p in positions {
            self.positions.insert((p.topic.clone(), p.partition), p.offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::profile::{ProfileCatalog, STANDARD};

    fn log_with_topic(partitions: i32) -> MemoryLog {
        let log = MemoryLog::new();
        log.ensure_topic(&TopicSpec::new("order-events", partitions, 1));
        log
    }

    #[test]
    fn test_same_key_same_partition() {
        let log = log_with_topic(3);
        let a = log.produce("order-events", Some("o1"), "a").unwrap();
        let b = log.produce("order-events", Some("o1"), "b").unwrap();
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn test_injected_failures_consume_retries() {
        let log = log_with_topic(1);
        let catalog = ProfileCatalog::builtin(2);
        let profile = catalog.producer_profile(STANDARD).unwrap();
        log.fail_sends("order-events", 2);

        let record = OutboundRecord {
            topic: "order-events".to_string(),
            key: Some("o1".to_string()),
            payload: Bytes::from_static(b"{}"),
        };
        let delivery = log.enqueue(profile, record).unwrap().await.unwrap();

        assert_eq!(delivery.offset, 0);
        assert_eq!(log.send_attempts("order-events"), 3);
    }

    #[tokio::test]
    async fn test_pending_transaction_is_invisible() {
        let log = log_with_topic(1);
        log.begin().await.unwrap();
        TransactionalLog::send(
            &log,
            OutboundRecord {
                topic: "order-events".to_string(),
                key: Some("o1".to_string()),
                payload: Bytes::from_static(b"{}"),
            },
        )
        .await
        .unwrap();

        assert!(log.records("order-events").is_empty());
        log.commit().await.unwrap();
        assert_eq!(log.records("order-events").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_when_record_appended() {
        let log = log_with_topic(1);
        let catalog = ProfileCatalog::builtin(2);
        let profile = catalog.consumer_profile(STANDARD).unwrap();
        let mut source = log
            .create(profile, &["order-events".to_string()], 0)
            .await
            .unwrap();

        let writer = log.clone();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.produce("order-events", Some("o1"), "{}").unwrap();
        });

        let records = tokio::spawn(async move { source.poll(10, Duration::from_secs(5)).await })
            .await
            .unwrap()
            .unwrap();
        producer.await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("o1"));
    }

    #[tokio::test]
    async fn test_admin_timeout_injection() {
        let log = MemoryLog::new();
        log.fail_admin(true);
        assert!(matches!(
            log.list_topics().await,
            Err(Error::AdminTimeout { operation }) if operation == "list_topics"
        ));
    }
}
