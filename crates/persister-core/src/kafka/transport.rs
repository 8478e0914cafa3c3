//! Seams between the core and the stream transport.
//!
//! The consume loop pulls from a [`MessageSource`] and the flush engine
//! commits through an [`OffsetCommitter`]. The Kafka consumer implements
//! both; tests substitute in-memory versions.

use super::KafkaMessage;
use crate::Result;
use async_trait::async_trait;

/// A lazy, effectively infinite sequence of raw messages.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` once the source has nothing more to give (never the
    /// case for a live Kafka subscription). An `Err` is a transport failure
    /// and is fatal to the loop.
    async fn next_message(&mut self) -> Option<Result<KafkaMessage>>;
}

/// Advances the durable consumption offset.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Commit the given `(topic, partition, offset)` positions, where
    /// `offset` is the last message processed. Completes only once the
    /// commit has been acknowledged. Committing the same positions twice is
    /// harmless.
    async fn commit(&self, offsets: &[(String, i32, i64)]) -> Result<()>;
}
