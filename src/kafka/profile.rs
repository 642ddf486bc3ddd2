//! Named delivery and consumer profiles.
//!
//! Every profile is one value of [`DeliveryProfile`] or [`ConsumerProfile`]
//! built from a static preset table, optionally adjusted by configuration
//! overrides, and frozen inside a [`ProfileCatalog`] for the life of the
//! process.

use crate::config::{Config, ConsumerOverride, ProducerOverride};
use crate::kafka::backoff::BackoffPolicy;
use crate::kafka::message::TopicRole;
use crate::{Error, Result};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const STANDARD: &str = "standard";
pub const TRANSACTIONAL: &str = "transactional";
pub const HIGH_THROUGHPUT: &str = "high-throughput";
pub const LOW_LATENCY: &str = "low-latency";
pub const RELIABLE: &str = "reliable";
pub const BATCH: &str = "batch";

const DEFAULT_BUFFER_BYTES: usize = 33_554_432; // 32MB

/// Replica confirmations required before a send counts as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    None,
    Leader,
    All,
}

impl Acks {
    pub fn as_config_value(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_config_value(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Producer-side tunables for one named profile.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryProfile {
    pub name: String,
    pub acks: Acks,
    pub max_retries: u32,
    pub idempotent: bool,
    pub batch_size_bytes: usize,
    pub linger_ms: u64,
    pub buffer_bytes: usize,
    pub compression: Compression,
    /// `None` leaves the client default in place.
    pub max_in_flight: Option<u32>,
    pub request_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    pub transactional: bool,
    /// Wait for the broker acknowledgment before `send` returns.
    pub await_ack: bool,
    pub targets: Vec<TopicRole>,
}

impl DeliveryProfile {
    fn base(name: &str, max_retries: u32) -> Self {
        Self {
            name: name.to_string(),
            acks: Acks::All,
            max_retries,
            idempotent: true,
            batch_size_bytes: 16_384,
            linger_ms: 5,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            compression: Compression::Snappy,
            max_in_flight: Some(1),
            request_timeout_ms: 30_000,
            delivery_timeout_ms: 120_000,
            transactional: false,
            await_ack: false,
            targets: vec![TopicRole::Primary],
        }
    }

    /// The five built-in presets.
    pub fn presets(max_retries: u32) -> Vec<DeliveryProfile> {
        let standard = Self::base(STANDARD, max_retries);

        let transactional = DeliveryProfile {
            transactional: true,
            await_ack: true,
            targets: vec![TopicRole::Primary, TopicRole::Secondary],
            ..Self::base(TRANSACTIONAL, max_retries)
        };

        let high_throughput = DeliveryProfile {
            acks: Acks::Leader,
            max_retries: 3,
            idempotent: false,
            batch_size_bytes: 65_536,
            linger_ms: 20,
            buffer_bytes: 67_108_864,
            compression: Compression::Lz4,
            max_in_flight: None,
            targets: vec![TopicRole::Secondary],
            ..Self::base(HIGH_THROUGHPUT, max_retries)
        };

        let low_latency = DeliveryProfile {
            batch_size_bytes: 0,
            linger_ms: 0,
            compression: Compression::None,
            request_timeout_ms: 5_000,
            delivery_timeout_ms: 10_000,
            await_ack: true,
            ..Self::base(LOW_LATENCY, max_retries)
        };

        let reliable = DeliveryProfile {
            request_timeout_ms: 60_000,
            delivery_timeout_ms: 300_000,
            await_ack: true,
            ..Self::base(RELIABLE, max_retries)
        };

        vec![standard, transactional, high_throughput, low_latency, reliable]
    }

    fn apply(&mut self, o: &ProducerOverride) {
        if let Some(acks) = o.acks {
            self.acks = acks;
        }
        if let Some(retries) = o.max_retries {
            self.max_retries = retries;
        }
        if let Some(idempotent) = o.idempotent {
            self.idempotent = idempotent;
        }
        if let Some(batch) = o.batch_size_bytes {
            self.batch_size_bytes = batch;
        }
        if let Some(linger) = o.linger_ms {
            self.linger_ms = linger;
        }
        if let Some(buffer) = o.buffer_bytes {
            self.buffer_bytes = buffer;
        }
        if let Some(compression) = o.compression {
            self.compression = compression;
        }
        if let Some(in_flight) = o.max_in_flight {
            self.max_in_flight = Some(in_flight);
        }
        if let Some(timeout) = o.request_timeout_ms {
            self.request_timeout_ms = timeout;
        }
        if let Some(timeout) = o.delivery_timeout_ms {
            self.delivery_timeout_ms = timeout;
        }
        if let Some(await_ack) = o.await_ack {
            self.await_ack = await_ack;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidProfile {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.transactional && (!self.idempotent || self.acks != Acks::All) {
            return Err(invalid("transactional profiles require idempotence and acks=all"));
        }
        if self.idempotent && self.acks != Acks::All {
            return Err(invalid("idempotent profiles require acks=all"));
        }
        if self.idempotent && self.max_in_flight.is_some_and(|n| n > 5) {
            return Err(invalid("idempotent profiles allow at most 5 in-flight requests"));
        }
        if self.targets.is_empty() || self.targets.contains(&TopicRole::DeadLetter) {
            return Err(invalid("profiles must target the primary or secondary topic"));
        }
        if !self.transactional && self.targets.len() != 1 {
            return Err(invalid("only transactional profiles may fan out to several topics"));
        }
        if self.delivery_timeout_ms < self.request_timeout_ms {
            return Err(invalid("delivery timeout must not be shorter than the request timeout"));
        }
        Ok(())
    }

    /// librdkafka settings for a producer running this profile.
    pub fn client_config(&self, bootstrap_servers: &str, client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("client.id", format!("{}-{}", client_id, self.name))
            .set("acks", self.acks.as_config_value())
            .set("enable.idempotence", self.idempotent.to_string())
            .set("message.send.max.retries", self.max_retries.to_string())
            .set("linger.ms", self.linger_ms.to_string())
            .set("queue.buffering.max.kbytes", (self.buffer_bytes / 1024).max(1).to_string())
            .set("compression.type", self.compression.as_config_value())
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("message.timeout.ms", self.delivery_timeout_ms.to_string());

        // librdkafka rejects batch.size=0; one message per batch is the equivalent.
        if self.batch_size_bytes == 0 {
            config.set("batch.num.messages", "1");
        } else {
            config.set("batch.size", self.batch_size_bytes.to_string());
        }

        if let Some(in_flight) = self.max_in_flight {
            config.set("max.in.flight.requests.per.connection", in_flight.to_string());
        }

        config
    }
}

/// Offset commit granularity of a consumption pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    PerRecord,
    PerBatch,
    /// Commit at most once per interval (milliseconds).
    Timed(u64),
}

/// What happens to a record once its retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalAction {
    DeadLetter,
    Drop,
    Halt,
}

/// Consumer-side tunables for one named profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerProfile {
    pub name: String,
    pub group_suffix: String,
    pub max_poll_records: usize,
    pub fetch_min_bytes: usize,
    pub fetch_max_wait_ms: u64,
    pub ack_mode: AckMode,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub on_exhausted: TerminalAction,
    /// Topic the pipeline subscribes to.
    pub source: TopicRole,
}

impl ConsumerProfile {
    #[allow(clippy::too_many_arguments)]
    fn preset(
        name: &str,
        group_suffix: &str,
        max_poll_records: usize,
        fetch_min_bytes: usize,
        fetch_max_wait_ms: u64,
        ack_mode: AckMode,
        concurrency: usize,
        source: TopicRole,
        backoff: &BackoffPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            group_suffix: group_suffix.to_string(),
            max_poll_records,
            fetch_min_bytes,
            fetch_max_wait_ms,
            ack_mode,
            concurrency,
            backoff: backoff.clone(),
            on_exhausted: TerminalAction::DeadLetter,
            source,
        }
    }

    /// The four built-in consumer presets.
    pub fn presets(backoff: &BackoffPolicy) -> Vec<ConsumerProfile> {
        vec![
            Self::preset(STANDARD, "", 500, 1, 500, AckMode::PerRecord, 1, TopicRole::Primary, backoff),
            Self::preset(BATCH, "-batch", 100, 1024, 500, AckMode::PerBatch, 1, TopicRole::Primary, backoff),
            Self::preset(
                HIGH_THROUGHPUT,
                "-high-throughput",
                1000,
                50_000,
                100,
                AckMode::PerBatch,
                5,
                TopicRole::Secondary,
                backoff,
            ),
            Self::preset(LOW_LATENCY, "-low-latency", 1, 1, 0, AckMode::PerRecord, 1, TopicRole::Primary, backoff),
        ]
    }

    fn apply(&mut self, o: &ConsumerOverride) {
        if let Some(max) = o.max_poll_records {
            self.max_poll_records = max;
        }
        if let Some(min) = o.fetch_min_bytes {
            self.fetch_min_bytes = min;
        }
        if let Some(wait) = o.fetch_max_wait_ms {
            self.fetch_max_wait_ms = wait;
        }
        if let Some(mode) = o.ack_mode {
            self.ack_mode = mode;
        }
        if let Some(concurrency) = o.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(action) = o.on_exhausted {
            self.on_exhausted = action;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidProfile {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.max_poll_records == 0 {
            return Err(invalid("max_poll_records must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if matches!(self.ack_mode, AckMode::Timed(0)) {
            return Err(invalid("timed ack interval must be positive"));
        }
        if self.source == TopicRole::DeadLetter {
            return Err(invalid("pipelines consume the primary or secondary topic"));
        }
        Ok(())
    }

    /// Records taken per poll cycle.
    pub fn records_per_cycle(&self) -> usize {
        match self.ack_mode {
            AckMode::PerBatch => self.max_poll_records,
            AckMode::PerRecord | AckMode::Timed(_) => 1,
        }
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn group_id(&self, base_group: &str) -> String {
        format!("{}{}", base_group, self.group_suffix)
    }

    /// librdkafka settings for one worker of this profile. Offsets are
    /// committed explicitly and only committed transactional data is read.
    pub fn client_config(&self, bootstrap_servers: &str, base_group: &str, client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", self.group_id(base_group))
            .set("client.id", format!("{}-{}", client_id, self.name))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("isolation.level", "read_committed")
            .set("fetch.min.bytes", self.fetch_min_bytes.max(1).to_string())
            .set("fetch.wait.max.ms", self.fetch_max_wait_ms.to_string())
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");
        config
    }
}

/// Immutable registry of every producer and consumer profile.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    producers: BTreeMap<String, DeliveryProfile>,
    consumers: BTreeMap<String, ConsumerProfile>,
}

impl ProfileCatalog {
    /// Built-in presets with the given retry budget and default backoff.
    pub fn builtin(max_retries: u32) -> Self {
        Self::assemble(
            DeliveryProfile::presets(max_retries),
            ConsumerProfile::presets(&BackoffPolicy::default()),
        )
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut producers = DeliveryProfile::presets(config.producer.max_retries);
        let mut consumers = ConsumerProfile::presets(&config.backoff_policy());

        for (name, overrides) in &config.profiles.producer {
            let profile = producers
                .iter_mut()
                .find(|p| &p.name == name)
                .ok_or_else(|| Error::UnknownProfile { name: name.clone() })?;
            profile.apply(overrides);
        }
        for (name, overrides) in &config.profiles.consumer {
            let profile = consumers
                .iter_mut()
                .find(|p| &p.name == name)
                .ok_or_else(|| Error::UnknownProfile { name: name.clone() })?;
            profile.apply(overrides);
        }

        Self::from_parts(producers, consumers)
    }

    /// Catalog of caller-built profiles. Every profile is validated.
    pub fn from_parts(producers: Vec<DeliveryProfile>, consumers: Vec<ConsumerProfile>) -> Result<Self> {
        producers.iter().try_for_each(DeliveryProfile::validate)?;
        consumers.iter().try_for_each(ConsumerProfile::validate)?;
        Ok(Self::assemble(producers, consumers))
    }

    fn assemble(producers: Vec<DeliveryProfile>, consumers: Vec<ConsumerProfile>) -> Self {
        Self {
            producers: producers.into_iter().map(|p| (p.name.clone(), p)).collect(),
            consumers: consumers.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn producer_profile(&self, name: &str) -> Result<&DeliveryProfile> {
        self.producers.get(name).ok_or_else(|| Error::UnknownProfile {
            name: name.to_string(),
        })
    }

    pub fn consumer_profile(&self, name: &str) -> Result<&ConsumerProfile> {
        self.consumers.get(name).ok_or_else(|| Error::UnknownProfile {
            name: name.to_string(),
        })
    }

    pub fn producer_profiles(&self) -> impl Iterator<Item = &DeliveryProfile> {
        self.producers.values()
    }

    pub fn consumer_profiles(&self) -> impl Iterator<Item = &ConsumerProfile> {
        self.consumers.values()
    }
}
