pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod kafka;
pub mod metrics;
pub mod relay;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::OrderGateway;
pub use metrics::Metrics;
pub use relay::{Backend, Relay};
