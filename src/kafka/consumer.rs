use crate::kafka::message::InboundRecord;
use crate::kafka::profile::ConsumerProfile;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A partition offset. For commits it is the next offset to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Position {
    /// Per partition, the offset after the last of `records`.
    pub fn after(records: &[InboundRecord]) -> Vec<Position> {
        Self::fold(records, |current, offset| current.max(offset + 1), |o| o + 1)
    }

    /// Per partition, the offset of the first of `records`.
    pub fn first(records: &[InboundRecord]) -> Vec<Position> {
        Self::fold(records, |current, offset| current.min(offset), |o| o)
    }

    fn fold(
        records: &[InboundRecord],
        merge: impl Fn(i64, i64) -> i64,
        init: impl Fn(i64) -> i64,
    ) -> Vec<Position> {
        let mut by_partition: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for record in records {
            by_partition
                .entry((record.topic.as_str(), record.partition))
                .and_modify(|current| *current = merge(*current, record.offset))
                .or_insert_with(|| init(record.offset));
        }
        by_partition
            .into_iter()
            .map(|((topic, partition), offset)| Position {
                topic: topic.to_string(),
                partition,
                offset,
            })
            .collect()
    }
}

/// One group member's view of its assigned partitions.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Up to `max` records. Waits at most `timeout` for the first one and
    /// returns an empty batch if none arrives.
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<InboundRecord>>;

    async fn commit(&mut self, positions: &[Position]) -> Result<()>;

    /// Rewinds so the next poll starts at `positions` again.
    async fn seek(&mut self, positions: &[Position]) -> Result<()>;
}

/// Creates one source per pipeline worker, joined to the profile's group.
#[async_trait]
pub trait RecordSourceFactory: Send + Sync {
    async fn create(
        &self,
        profile: &ConsumerProfile,
        topics: &[String],
        worker: usize,
    ) -> Result<Box<dyn RecordSource>>;
}

pub struct KafkaSourceFactory {
    bootstrap_servers: String,
    group_base: String,
    client_id: String,
}

impl KafkaSourceFactory {
    pub fn new(bootstrap_servers: String, group_base: String, client_id: String) -> Self {
        Self {
            bootstrap_servers,
            group_base,
            client_id,
        }
    }
}

#[async_trait]
impl RecordSourceFactory for KafkaSourceFactory {
    async fn create(
        &self,
        profile: &ConsumerProfile,
        topics: &[String],
        worker: usize,
    ) -> Result<Box<dyn RecordSource>> {
        let consumer: StreamConsumer = profile
            .client_config(&self.bootstrap_servers, &self.group_base, &self.client_id)
            .create()
            .map_err(Error::Kafka)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(Error::Kafka)?;

        info!(
            profile = %profile.name,
            group = %profile.group_id(&self.group_base),
            worker,
            topics = ?topics,
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaRecordSource {
            consumer: Arc::new(consumer),
            linger: profile.fetch_max_wait(),
        }))
    }
}

/// rdkafka stream consumer with manual offset commits.
pub struct KafkaRecordSource {
    consumer: Arc<StreamConsumer>,
    linger: Duration,
}

impl KafkaRecordSource {
    fn to_inbound(message: &BorrowedMessage<'_>) -> InboundRecord {
        InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        }
    }

    fn partition_list(positions: &[Position]) -> Result<TopicPartitionList> {
        let mut list = TopicPartitionList::new();
        for position in positions {
            list.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset))
                .map_err(Error::Kafka)?;
        }
        Ok(list)
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<InboundRecord>> {
        let mut records = Vec::new();

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => records.push(Self::to_inbound(&message)),
            Ok(Err(e)) => return Err(Error::Kafka(e)),
            Err(_) => return Ok(records),
        }

        // Keep filling the batch until it is full or the fetch wait runs out.
        let deadline = Instant::now() + self.linger;
        while records.len() < max {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(Self::to_inbound(&message)),
                Ok(Err(e)) => {
                    warn!(error = %e, "Receive failed while filling batch");
                    break;
                }
                Err(_) => break,
            }
        }

        debug!(count = records.len(), "Polled records");
        Ok(records)
    }

    async fn commit(&mut self, positions: &[Position]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let list = Self::partition_list(positions)?;
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| Error::transport("", e))?
            .map_err(Error::Kafka)
    }

    async fn seek(&mut self, positions: &[Position]) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let positions = positions.to_vec();
        tokio::task::spawn_blocking(move || {
            for p in &positions {
                consumer.seek(&p.topic, p.partition, Offset::Offset(p.offset), Duration::from_secs(10))?;
            }
            Ok::<(), rdkafka::error::KafkaError>(())
        })
        .await
        .map_err(|e| Error::transport("", e))?
        .map_err(Error::Kafka)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> InboundRecord {
        InboundRecord {
            topic: "order-events".to_string(),
            partition,
            offset,
            key: None,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_positions_per_partition() {
        let records = vec![record(0, 4), record(1, 9), record(0, 5), record(0, 6)];

        let after = Position::after(&records);
        assert_eq!(after.len(), 2);
        assert_eq!((after[0].partition, after[0].offset), (0, 7));
        assert_eq!((after[1].partition, after[1].offset), (1, 10));

        let first = Position::first(&records);
        assert_eq!((first[0].partition, first[0].offset), (0, 4));
        assert_eq!((first[1].partition, first[1].offset), (1, 9));
    }

    #[test]
    fn test_no_records_no_positions() {
        assert!(Position::after(&[]).is_empty());
    }
}
