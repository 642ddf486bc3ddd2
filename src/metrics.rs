use crate::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters for every publish attempt, dead-letter write, consumed record
/// and transaction. Owned by the process and passed to each component.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Labels: profile
    pub publish_attempts: IntCounterVec,
    /// Labels: profile, outcome
    pub publish_outcomes: IntCounterVec,
    /// Labels: origin, result
    pub dead_letter_writes: IntCounterVec,
    /// Labels: profile, result
    pub consumed_records: IntCounterVec,
    /// Labels: profile
    pub handler_retries: IntCounterVec,
    /// Labels: result
    pub transactions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("order_relay".to_string()), None)?;

        let publish_attempts = counter(
            &registry,
            "publish_attempts_total",
            "Messages handed to a delivery profile",
            &["profile"],
        )?;
        let publish_outcomes = counter(
            &registry,
            "publish_outcomes_total",
            "Final publish outcomes by profile",
            &["profile", "outcome"],
        )?;
        let dead_letter_writes = counter(
            &registry,
            "dead_letter_writes_total",
            "Dead-letter write attempts",
            &["origin", "result"],
        )?;
        let consumed_records = counter(
            &registry,
            "consumed_records_total",
            "Records handled by consumption pipelines",
            &["profile", "result"],
        )?;
        let handler_retries = counter(
            &registry,
            "handler_retries_total",
            "Handler retries scheduled after a failure",
            &["profile"],
        )?;
        let transactions = counter(
            &registry,
            "transactions_total",
            "Transactional units of work",
            &["result"],
        )?;

        Ok(Self {
            registry,
            publish_attempts,
            publish_outcomes,
            dead_letter_writes,
            consumed_records,
            handler_retries,
            transactions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn dead_letter_attempts(&self, origin: &str) -> u64 {
        ["written", "failed"]
            .iter()
            .map(|result| self.dead_letter_writes.with_label_values(&[origin, result]).get())
            .sum()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
