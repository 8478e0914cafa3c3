//! Persister Core - Kafka to time-series database persistence
//!
//! This library consumes monitoring messages from Apache Kafka, converts
//! them into data points and writes them to InfluxDB in batches:
//!
//! - Offsets are committed only after the batch covering them is written
//! - Rebalance and commit-timeout callbacks share the size-triggered flush path
//! - Points refused by the retention policy are dropped without stopping
//! - Any other write failure stops the process

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod point;
pub mod sink;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConversionError, KafkaError, StorageError};
pub use error::{Error, Result};
