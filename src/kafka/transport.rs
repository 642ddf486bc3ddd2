//! Seams between the delivery logic and the log service client.
//!
//! [`LogTransport`] covers plain (non-transactional) sends, one producer per
//! delivery profile. [`TransactionalLog`] covers the single transactional
//! producer of a process. Both have rdkafka implementations here and an
//! in-memory implementation in [`crate::kafka::memory`].

use crate::kafka::profile::{DeliveryProfile, ProfileCatalog};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A record ready to be written to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    /// `None` leaves partition choice to the producer.
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Where the broker stored an acknowledged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Resolves once the broker has acknowledged (or finally rejected) a record.
pub type DeliveryFuture = BoxFuture<'static, Result<Delivery>>;

pub trait LogTransport: Send + Sync {
    /// Hands a record to the profile's local producer buffer.
    ///
    /// An `Err` means the record never entered the buffer. Retries after
    /// that point belong to the transport and are bounded by the profile's
    /// `max_retries`; the returned future reports the final result.
    fn enqueue(&self, profile: &DeliveryProfile, record: OutboundRecord) -> Result<DeliveryFuture>;

    /// Waits for buffered records to leave the process.
    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// A producer bound to one transactional id.
#[async_trait]
pub trait TransactionalLog: Send + Sync {
    fn transactional_id(&self) -> &str;

    async fn begin(&self) -> Result<()>;

    async fn send(&self, record: OutboundRecord) -> Result<Delivery>;

    async fn commit(&self) -> Result<()>;

    async fn abort(&self) -> Result<()>;
}

/// One rdkafka producer per non-transactional delivery profile.
pub struct KafkaTransport {
    producers: HashMap<String, FutureProducer>,
}

impl KafkaTransport {
    pub fn new(catalog: &ProfileCatalog, bootstrap_servers: &str, client_id: &str) -> Result<Self> {
        let mut producers = HashMap::new();
        for profile in catalog.producer_profiles().filter(|p| !p.transactional) {
            let producer: FutureProducer = profile
                .client_config(bootstrap_servers, client_id)
                .create()
                .map_err(Error::Kafka)?;
            info!(
                profile = %profile.name,
                acks = profile.acks.as_config_value(),
                idempotent = profile.idempotent,
                compression = profile.compression.as_config_value(),
                "Kafka producer created"
            );
            producers.insert(profile.name.clone(), producer);
        }
        Ok(Self { producers })
    }
}

impl LogTransport for KafkaTransport {
    fn enqueue(&self, profile: &DeliveryProfile, record: OutboundRecord) -> Result<DeliveryFuture> {
        let producer = self
            .producers
            .get(&profile.name)
            .ok_or_else(|| Error::UnknownProfile {
                name: profile.name.clone(),
            })?;

        let future = producer
            .send_result(future_record(&record))
            .map_err(|(e, _)| Error::transport(&record.topic, e))?;

        let topic = record.topic;
        Ok(async move {
            match future.await {
                Ok(Ok((partition, offset))) => Ok(Delivery {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(Error::transport(topic, e)),
                Err(_) => Err(Error::transport(topic, "producer dropped the delivery report")),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        for (name, producer) in &self.producers {
            if let Err(e) = producer.flush(Timeout::After(timeout)) {
                warn!(profile = %name, error = %e, "Producer flush incomplete");
            }
        }
        Ok(())
    }
}

fn future_record(record: &OutboundRecord) -> FutureRecord<'_, str, [u8]> {
    let future_record = FutureRecord::to(&record.topic).payload(&record.payload[..]);
    match record.key.as_deref() {
        Some(key) => future_record.key(key),
        None => future_record,
    }
}

/// rdkafka producer configured with a `transactional.id`.
pub struct KafkaTransactionalLog {
    producer: FutureProducer,
    transactional_id: String,
    timeout: Duration,
}

impl KafkaTransactionalLog {
    /// Creates the producer and registers its transactional id with the
    /// broker, fencing any earlier producer that used the same id.
    #[instrument(skip(profile, bootstrap_servers, client_id), fields(profile = %profile.name))]
    pub async fn connect(
        profile: &DeliveryProfile,
        bootstrap_servers: &str,
        client_id: &str,
        transactional_id: String,
    ) -> Result<Self> {
        let producer: FutureProducer = profile
            .client_config(bootstrap_servers, client_id)
            .set("transactional.id", &transactional_id)
            .create()
            .map_err(Error::Kafka)?;

        let timeout = Duration::from_millis(profile.delivery_timeout_ms);
        let init = producer.clone();
        tokio::task::spawn_blocking(move || init.init_transactions(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::transport("", e))??;

        info!(transactional_id = %transactional_id, "Transactional producer initialized");
        Ok(Self {
            producer,
            transactional_id,
            timeout,
        })
    }

    async fn blocking<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&FutureProducer, Timeout) -> rdkafka::error::KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer.clone();
        let timeout = Timeout::After(self.timeout);
        tokio::task::spawn_blocking(move || op(&producer, timeout))
            .await
            .map_err(|e| Error::TransactionAbort {
                reason: e.to_string(),
            })?
            .map_err(Error::Kafka)
    }
}

#[async_trait]
impl TransactionalLog for KafkaTransactionalLog {
    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    async fn begin(&self) -> Result<()> {
        self.producer.begin_transaction().map_err(Error::Kafka)
    }

    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        let (partition, offset) = self
            .producer
            .send(future_record(&record), Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| Error::transport(&record.topic, e))?;
        debug!(topic = %record.topic, partition, offset, "Transactional record staged");
        Ok(Delivery {
            topic: record.topic,
            partition,
            offset,
        })
    }

    async fn commit(&self) -> Result<()> {
        self.blocking(|p, t| p.commit_transaction(t)).await
    }

    async fn abort(&self) -> Result<()> {
        self.blocking(|p, t| p.abort_transaction(t)).await
    }
}
