//! Error types and result handling for order-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use order_relay::kafka::ProfileCatalog;
//! use order_relay::Error;
//!
//! let catalog = ProfileCatalog::builtin(3);
//! match catalog.producer_profile("express") {
//!     Ok(profile) => println!("using {}", profile.name),
//!     Err(Error::UnknownProfile { name }) => eprintln!("no such profile: {}", name),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for order-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A profile name that is not registered in the catalog.
    #[error("Unknown profile: {name}")]
    UnknownProfile {
        /// The requested profile name
        name: String,
    },

    /// A profile whose tunables violate an invariant (for example a
    /// transactional profile without idempotence).
    #[error("Invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    /// Raw Kafka client error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Broker unreachable or delivery timed out after the transport's retries.
    #[error("Transport error on topic '{topic}': {message}")]
    Transport { topic: String, message: String },

    /// Malformed payload. Never retried.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A transactional unit of work was rolled back.
    #[error("Transaction aborted: {reason}")]
    TransactionAbort { reason: String },

    /// A topic exists but its shape differs from what was requested.
    #[error("Topic drift: {0}")]
    TopicDrift(TopicDrift),

    /// An admin operation did not complete within its timeout.
    #[error("Admin operation '{operation}' timed out")]
    AdminTimeout { operation: String },

    /// Failure reported by the event store.
    #[error("Event store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration failure.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// An admin call was made outside an open admin session.
    #[error("Admin session is not open")]
    AdminSessionClosed,

    /// A consumption pipeline stopped because a record exhausted its retries
    /// under the `halt` terminal action.
    #[error("Pipeline '{profile}' halted: {reason}")]
    PipelineHalted { profile: String, reason: String },
}

impl Error {
    pub(crate) fn transport(topic: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Transport {
            topic: topic.into(),
            message: message.to_string(),
        }
    }
}

/// Expected vs. observed shape of an existing topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDrift {
    pub topic: String,
    pub expected_partitions: i32,
    pub actual_partitions: i32,
    pub expected_replication: i32,
    pub actual_replication: i32,
}

impl fmt::Display for TopicDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topic '{}' has {} partitions (expected {}) and replication factor {} (expected {})",
            self.topic,
            self.actual_partitions,
            self.expected_partitions,
            self.actual_replication,
            self.expected_replication
        )
    }
}

/// A convenient Result type alias for order-relay operations.
///
/// This is equivalent to `std::result::Result<T, order_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
