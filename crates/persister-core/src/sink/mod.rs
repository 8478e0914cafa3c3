//! Storage sinks that durably write batches of points.
//!
//! A sink classifies its own failures into [`StorageError`] variants; the
//! flush engine only asks [`StorageError::is_recoverable`].

mod influxdb;

pub use influxdb::InfluxDbSink;

use crate::error::StorageError;
use crate::point::DataPoint;
use async_trait::async_trait;

/// Durable batch writer.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Write `points` in order. `topic` identifies the source stream for
    /// logging and labeling.
    async fn write_batch(&self, points: &[DataPoint], topic: &str) -> Result<(), StorageError>;
}
