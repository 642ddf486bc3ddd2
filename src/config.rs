use crate::kafka::backoff::BackoffPolicy;
use crate::kafka::message::{TopicRole, TopicSpec};
use crate::kafka::profile::{Acks, AckMode, Compression, TerminalAction};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub profiles: ProfileOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_admin_timeout_secs")]
    pub admin_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    #[serde(default = "default_primary_topic")]
    pub primary: String,
    #[serde(default = "default_secondary_topic")]
    pub secondary: String,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default)]
    pub drift_policy: DriftPolicy,
}

/// What topic reconciliation does when an existing topic has the wrong shape.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DriftPolicy {
    #[default]
    Warn,
    FailFast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_transactional_id_prefix")]
    pub transactional_id_prefix: String,
    #[serde(default = "default_true")]
    pub enable_transactions: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
    /// Consumer profiles started by `Relay::run`.
    #[serde(default = "default_consumer_profiles")]
    pub profiles: Vec<String>,
}

/// What a worker does with the batch it is processing when shutdown is requested.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    #[default]
    CompleteInFlight,
    DiscardInFlight,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileOverrides {
    #[serde(default)]
    pub producer: HashMap<String, ProducerOverride>,
    #[serde(default)]
    pub consumer: HashMap<String, ConsumerOverride>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProducerOverride {
    pub acks: Option<Acks>,
    pub max_retries: Option<u32>,
    pub idempotent: Option<bool>,
    pub batch_size_bytes: Option<usize>,
    pub linger_ms: Option<u64>,
    pub buffer_bytes: Option<usize>,
    pub compression: Option<Compression>,
    pub max_in_flight: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
    pub await_ack: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConsumerOverride {
    pub max_poll_records: Option<usize>,
    pub fetch_min_bytes: Option<usize>,
    pub fetch_max_wait_ms: Option<u64>,
    pub ack_mode: Option<AckMode>,
    pub concurrency: Option<usize>,
    pub on_exhausted: Option<TerminalAction>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ORDER_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("consumer.profiles")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        let names = [&self.topics.primary, &self.topics.secondary, &self.topics.dead_letter];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::Config("topic names must not be empty".to_string()));
        }
        if self.topics.dead_letter == self.topics.primary
            || self.topics.dead_letter == self.topics.secondary
        {
            return Err(Error::Config(
                "the dead-letter topic must differ from the event topics".to_string(),
            ));
        }
        if self.topics.partitions < 1 || self.topics.replication_factor < 1 {
            return Err(Error::Config(
                "topics.partitions and topics.replication_factor must be positive".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.kafka.brokers.join(",")
    }

    pub fn topic_name(&self, role: TopicRole) -> &str {
        self.topics.name_for(role)
    }

    /// Topics that must exist before any pipeline starts polling.
    pub fn required_topics(&self) -> Vec<TopicSpec> {
        [TopicRole::Secondary, TopicRole::Primary, TopicRole::DeadLetter]
            .into_iter()
            .map(|role| {
                TopicSpec::new(
                    self.topic_name(role),
                    self.topics.partitions,
                    self.topics.replication_factor,
                )
            })
            .collect()
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.retry.backoff_delay_ms),
            multiplier: self.retry.multiplier,
            max_elapsed: Duration::from_millis(self.retry.max_elapsed_ms),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka.admin_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.poll_timeout_ms)
    }
}

impl TopicsConfig {
    pub fn name_for(&self, role: TopicRole) -> &str {
        match role {
            TopicRole::Primary => &self.primary,
            TopicRole::Secondary => &self.secondary,
            TopicRole::DeadLetter => &self.dead_letter,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            admin_timeout_secs: default_admin_timeout_secs(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_topic(),
            secondary: default_secondary_topic(),
            dead_letter: default_dead_letter_topic(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            drift_policy: DriftPolicy::default(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            transactional_id_prefix: default_transactional_id_prefix(),
            enable_transactions: true,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            poll_timeout_ms: default_poll_timeout_ms(),
            shutdown_policy: ShutdownPolicy::default(),
            profiles: default_consumer_profiles(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_delay_ms: default_backoff_delay_ms(),
            multiplier: default_multiplier(),
            max_elapsed_ms: default_max_elapsed_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "order-relay".to_string()
}

fn default_admin_timeout_secs() -> u64 {
    30
}

fn default_primary_topic() -> String {
    "order-events".to_string()
}

fn default_secondary_topic() -> String {
    "user-events".to_string()
}

fn default_dead_letter_topic() -> String {
    "dead-letter-queue".to_string()
}

fn default_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_transactional_id_prefix() -> String {
    "order-relay-tx".to_string()
}

fn default_true() -> bool {
    true
}

fn default_group_id() -> String {
    "order-relay-consumer-group".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_consumer_profiles() -> Vec<String> {
    vec!["standard".to_string()]
}

fn default_backoff_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_elapsed_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["kafka-1:9092", "kafka-2:9092"]
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.topics.primary, "order-events");
        assert_eq!(config.topics.dead_letter, "dead-letter-queue");
        assert_eq!(config.topics.drift_policy, DriftPolicy::Warn);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.consumer.shutdown_policy, ShutdownPolicy::CompleteInFlight);
    }

    #[test]
    fn test_profile_overrides_are_parsed() {
        let file = write_config(
            r#"
            [topics]
            drift_policy = "fail-fast"

            [profiles.producer.standard]
            linger_ms = 50
            compression = "zstd"

            [profiles.consumer.batch]
            ack_mode = { timed = 2000 }
            on_exhausted = "halt"
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.topics.drift_policy, DriftPolicy::FailFast);
        let standard = &config.profiles.producer["standard"];
        assert_eq!(standard.linger_ms, Some(50));
        assert_eq!(standard.compression, Some(Compression::Zstd));
        let batch = &config.profiles.consumer["batch"];
        assert_eq!(batch.ack_mode, Some(AckMode::Timed(2000)));
        assert_eq!(batch.on_exhausted, Some(TerminalAction::Halt));
    }

    #[test]
    fn test_dead_letter_topic_must_be_distinct() {
        let mut config = Config::default();
        config.topics.dead_letter = config.topics.primary.clone();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_required_topics_cover_every_role() {
        let config = Config::default();
        let names: Vec<String> = config.required_topics().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["user-events", "order-events", "dead-letter-queue"]);
    }

    #[test]
    fn test_backoff_policy_from_retry_section() {
        let config = Config::default();
        let policy = config.backoff_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_elapsed, Duration::from_millis(10_000));
        assert_eq!(policy.max_attempts, 3);
    }
}
