//! Offset tracking for Kafka partitions.

use std::collections::BTreeMap;

/// Highest consumed offset per (topic, partition) since the last commit.
///
/// Only the flush engine touches this, always while holding its buffer lock,
/// so offsets recorded here always belong to points already in the buffer
/// (or to messages that were dropped before them).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OffsetTracker {
    pending: BTreeMap<(String, i32), i64>,
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the message at `offset` has been consumed.
    ///
    /// Offsets only move forward: a lower offset for a partition already
    /// tracked is ignored.
    pub fn record(&mut self, topic: &str, partition: i32, offset: i64) {
        self.pending
            .entry((topic.to_string(), partition))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    /// Get the pending offset for a partition.
    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.pending.get(&(topic.to_string(), partition)).copied()
    }

    /// Snapshot of all pending offsets as `(topic, partition, offset)`.
    pub fn snapshot(&self) -> Vec<(String, i32, i64)> {
        self.pending
            .iter()
            .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
            .collect()
    }

    /// Forget everything recorded; called once the offsets are committed.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
