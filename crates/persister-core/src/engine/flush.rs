//! Batch buffer and flush engine.
//!
//! All buffer access goes through one async mutex. It is held for the whole
//! write-commit-clear sequence, so at most one write is ever in flight and an
//! offset is never committed for points that were not durably written.

use crate::error::StorageError;
use crate::health::{Component, HealthCheck};
use crate::kafka::{OffsetCommitter, OffsetTracker};
use crate::metrics::PersisterMetrics;
use crate::point::DataPoint;
use crate::sink::StorageSink;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Shortest window used for the throughput gauge. Two flushes within the
/// same clock tick would otherwise divide by zero.
pub const MIN_RATE_WINDOW: Duration = Duration::from_millis(1);

/// What a flush call did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending; no write, no commit.
    Skipped,
    /// The whole batch was written and its offsets committed.
    Success { points: usize },
    /// The backend refused part of the batch for policy reasons. The batch
    /// is discarded and its offsets committed anyway.
    RecoverablePartialWrite {
        points: usize,
        dropped: Option<u64>,
    },
}

struct BatchState {
    points: Vec<DataPoint>,
    offsets: OffsetTracker,
    last_flush: Instant,
    last_commit: Instant,
    halted: bool,
}

/// Owns the buffer and runs the write/commit protocol.
pub struct FlushEngine {
    topic: String,
    batch_size: usize,
    sink: Arc<dyn StorageSink>,
    committer: Arc<dyn OffsetCommitter>,
    metrics: Arc<PersisterMetrics>,
    health: Arc<HealthCheck>,
    state: Mutex<BatchState>,
}

impl FlushEngine {
    pub fn new(
        topic: impl Into<String>,
        batch_size: usize,
        sink: Arc<dyn StorageSink>,
        committer: Arc<dyn OffsetCommitter>,
        metrics: Arc<PersisterMetrics>,
        health: Arc<HealthCheck>,
    ) -> Self {
        let now = Instant::now();
        Self {
            topic: topic.into(),
            batch_size,
            sink,
            committer,
            metrics,
            health,
            state: Mutex::new(BatchState {
                points: Vec::new(),
                offsets: OffsetTracker::new(),
                last_flush: now,
                last_commit: now,
                halted: false,
            }),
        }
    }

    /// Append a point consumed from `partition` at `offset`.
    ///
    /// Returns the buffer length afterwards; the caller compares it with
    /// [`batch_size`](Self::batch_size). After a fatal flush the engine no
    /// longer accepts points.
    pub async fn accumulate(&self, point: DataPoint, partition: i32, offset: i64) -> usize {
        let mut state = self.state.lock().await;
        if state.halted {
            return state.points.len();
        }
        state.points.push(point);
        state.offsets.record(&self.topic, partition, offset);
        state.points.len()
    }

    /// Record the position of a message that produced no point, so the next
    /// commit moves past it. The buffer is not touched.
    pub async fn skip(&self, partition: i32, offset: i64) {
        let mut state = self.state.lock().await;
        if !state.halted {
            state.offsets.record(&self.topic, partition, offset);
        }
    }

    /// Write out everything pending.
    ///
    /// Safe to call at any time from any task: with nothing pending it
    /// returns [`FlushOutcome::Skipped`] without touching the sink, the
    /// committer or the metrics. A fatal write error is returned with the
    /// buffer and offsets left untouched, and halts the engine.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let mut state = self.state.lock().await;

        if state.halted {
            return Err(Error::Halted);
        }
        if state.points.is_empty() {
            return Ok(FlushOutcome::Skipped);
        }

        let count = state.points.len();
        debug!(topic = %self.topic, points = count, "Flushing batch");

        let started = Instant::now();
        match self.sink.write_batch(&state.points, &self.topic).await {
            Ok(()) => {
                let write_duration = started.elapsed();
                let now = Instant::now();
                let window = now
                    .saturating_duration_since(state.last_flush)
                    .max(MIN_RATE_WINDOW);
                let rate = count as f64 / window.as_secs_f64();

                self.metrics
                    .record_flush(&self.topic, count, write_duration, rate);
                self.commit(&mut state).await?;
                state.points.clear();
                state.last_flush = now;
                self.health.mark_healthy(Component::Storage);

                info!(
                    topic = %self.topic,
                    points = count,
                    write_ms = write_duration.as_millis() as u64,
                    rate = rate,
                    "Processed {} messages from topic '{}'",
                    count,
                    self.topic
                );
                Ok(FlushOutcome::Success { points: count })
            }
            Err(e) if e.is_recoverable() => {
                let dropped = match &e {
                    StorageError::PartialWrite { dropped, .. } => *dropped,
                    _ => None,
                };
                warn!(
                    topic = %self.topic,
                    points = count,
                    dropped = ?dropped,
                    error = %e,
                    "Some points older than retention policy were dropped"
                );

                self.commit(&mut state).await?;
                state.points.clear();
                self.metrics.record_partial_write(&self.topic);
                self.health
                    .mark_degraded(Component::Storage, "points beyond retention policy dropped");

                Ok(FlushOutcome::RecoverablePartialWrite {
                    points: count,
                    dropped,
                })
            }
            Err(e) => {
                error!(
                    topic = %self.topic,
                    points = ?state.points,
                    error = %e,
                    "Error writing to database"
                );
                state.halted = true;
                self.health
                    .mark_unhealthy(Component::Storage, &e.to_string());
                Err(Error::Storage(e))
            }
        }
    }

    /// Commit the offsets of the batch held in `state`. Must be called with
    /// the lock held, before the buffer is cleared.
    async fn commit(&self, state: &mut BatchState) -> Result<()> {
        let offsets = state.offsets.snapshot();
        if offsets.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.committer.commit(&offsets).await {
            error!(
                topic = %self.topic,
                offsets = ?offsets,
                points = ?state.points,
                error = %e,
                "Offset commit failed after write"
            );
            state.halted = true;
            self.health.mark_unhealthy(Component::Kafka, &e.to_string());
            return Err(e);
        }

        state.offsets.clear();
        state.last_commit = Instant::now();
        Ok(())
    }

    /// Flush threshold.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of points waiting for the next flush.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.points.len()
    }

    /// Copy of the points waiting for the next flush.
    pub async fn pending_points(&self) -> Vec<DataPoint> {
        self.state.lock().await.points.clone()
    }

    /// Offsets that the next successful flush will commit.
    pub async fn pending_offsets(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().await.offsets.snapshot()
    }

    /// Time since offsets were last committed (or since startup).
    pub async fn since_last_commit(&self) -> Duration {
        self.state.lock().await.last_commit.elapsed()
    }

    /// Whether a fatal flush has stopped the engine.
    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    pub fn metrics(&self) -> &Arc<PersisterMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::health::ComponentStatus;

    #[tokio::test]
    async fn test_accumulate_counts_points_since_last_flush() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(10, sink.clone(), committer.clone());

        for n in 0..4 {
            assert_eq!(engine.accumulate(point(n), 0, n).await, (n + 1) as usize);
        }
        engine.flush().await.unwrap();

        assert_eq!(engine.accumulate(point(4), 0, 4).await, 1);
        assert_eq!(engine.accumulate(point(5), 1, 0).await, 2);
        assert_eq!(engine.pending().await, 2);
        assert_eq!(
            engine.pending_offsets().await,
            vec![("metrics".to_string(), 0, 4), ("metrics".to_string(), 1, 0)]
        );
    }

    #[tokio::test]
    async fn test_skipped_offsets_ride_along_with_next_commit() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(10, sink.clone(), committer.clone());

        engine.skip(0, 3).await;
        assert_eq!(engine.pending().await, 0);
        // Nothing buffered, so nothing to commit yet
        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Skipped);
        assert_eq!(committer.count(), 0);

        engine.accumulate(point(1), 1, 8).await;
        engine.skip(0, 4).await;
        engine.flush().await.unwrap();
        assert_eq!(
            committer.last(),
            Some(vec![("metrics".to_string(), 0, 4), ("metrics".to_string(), 1, 8)])
        );
    }

    #[tokio::test]
    async fn test_flush_empty_buffer_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(3, sink.clone(), committer.clone());

        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Skipped);
        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Skipped);

        assert!(sink.batches.lock().is_empty());
        assert_eq!(committer.count(), 0);
        assert_eq!(engine.metrics().messages_total(), 0);
        assert_eq!(engine.metrics().messages_for_topic("metrics"), 0);
    }

    #[tokio::test]
    async fn test_successful_flush_commits_and_clears() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(3, sink.clone(), committer.clone());

        engine.accumulate(point(1), 0, 10).await;
        engine.accumulate(point(2), 0, 11).await;
        engine.accumulate(point(3), 2, 7).await;

        let outcome = engine.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Success { points: 3 });

        assert_eq!(engine.pending().await, 0);
        assert!(engine.pending_offsets().await.is_empty());
        assert_eq!(sink.batches.lock()[0], vec![point(1), point(2), point(3)]);
        assert_eq!(
            committer.last(),
            Some(vec![
                ("metrics".to_string(), 0, 11),
                ("metrics".to_string(), 2, 7)
            ])
        );
        assert_eq!(engine.metrics().messages_total(), 3);
        assert_eq!(engine.metrics().messages_for_topic("metrics"), 3);
        assert!(engine.metrics().messages_per_second("metrics") > 0.0);
        assert_eq!(engine.health().status(Component::Storage), ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_back_to_back_flushes_have_finite_rate() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(1, sink.clone(), committer.clone());

        for n in 0..3 {
            engine.accumulate(point(n), 0, n).await;
            engine.flush().await.unwrap();
            let rate = engine.metrics().messages_per_second("metrics");
            assert!(rate.is_finite());
            // One point over at least MIN_RATE_WINDOW
            assert!(rate <= 1.0 / MIN_RATE_WINDOW.as_secs_f64());
        }
    }

    #[tokio::test]
    async fn test_partial_write_clears_and_commits() {
        let sink = Arc::new(RecordingSink::failing_with(StorageError::PartialWrite {
            dropped: Some(2),
            message: "partial write: points beyond retention policy dropped=2".into(),
        }));
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(4, sink.clone(), committer.clone());

        for n in 0..4 {
            engine.accumulate(point(n), 0, n).await;
        }

        let outcome = engine.flush().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::RecoverablePartialWrite {
                points: 4,
                dropped: Some(2)
            }
        );
        assert_eq!(engine.pending().await, 0);
        assert_eq!(committer.last(), Some(vec![("metrics".to_string(), 0, 3)]));
        assert!(!engine.is_halted().await);
        assert_eq!(engine.metrics().partial_writes("metrics"), 1);
        // Written-message counters only move on full success
        assert_eq!(engine.metrics().messages_total(), 0);
        assert!(matches!(
            engine.health().status(Component::Storage),
            ComponentStatus::Degraded(_)
        ));

        // The engine keeps working afterwards
        engine.accumulate(point(9), 0, 4).await;
        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Success { points: 1 }
        );
    }

    #[tokio::test]
    async fn test_fatal_write_retains_buffer_and_halts() {
        let sink = Arc::new(RecordingSink::failing_with(StorageError::Rejected {
            status: 500,
            message: "engine: error writing WAL entry".into(),
        }));
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(2, sink.clone(), committer.clone());

        engine.accumulate(point(1), 0, 1).await;
        engine.accumulate(point(2), 0, 2).await;

        let err = engine.flush().await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Rejected { status: 500, .. })));

        assert_eq!(engine.pending_points().await, vec![point(1), point(2)]);
        assert_eq!(engine.pending_offsets().await, vec![("metrics".to_string(), 0, 2)]);
        assert_eq!(committer.count(), 0);
        assert!(engine.is_halted().await);
        assert!(matches!(
            engine.health().status(Component::Storage),
            ComponentStatus::Unhealthy(_)
        ));

        // No further writes, commits or buffer mutation
        assert!(matches!(engine.flush().await, Err(Error::Halted)));
        assert_eq!(engine.accumulate(point(3), 0, 3).await, 2);
        assert!(sink.batches.lock().is_empty());
        assert_eq!(committer.count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_write_logs_retained_buffer() {
        let (logs, _guard) = capture_logs();
        let sink = Arc::new(RecordingSink::failing_with(StorageError::Transport(
            "connection reset".into(),
        )));
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(2, sink, committer);

        engine.accumulate(point(7), 0, 1).await;
        engine.accumulate(point(8), 0, 2).await;
        engine.flush().await.unwrap_err();

        let output = logs.to_string();
        let line = output
            .lines()
            .find(|line| line.contains("Error writing to database"))
            .expect("fatal write is logged");
        assert!(line.contains("ERROR"));
        assert!(line.contains("connection reset"));
        assert!(line.contains("node-7"));
        assert!(line.contains("node-8"));
    }

    #[tokio::test]
    async fn test_huge_batch_size_does_not_preallocate() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(usize::MAX, sink.clone(), committer.clone());

        assert_eq!(engine.accumulate(point(1), 0, 1).await, 1);
        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Success { points: 1 });
    }

    #[tokio::test]
    async fn test_commit_failure_is_fatal() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter {
            fail: true,
            ..RecordingCommitter::default()
        });
        let engine = engine(1, sink.clone(), committer.clone());

        engine.accumulate(point(1), 0, 1).await;
        let err = engine.flush().await.unwrap_err();
        assert!(matches!(err, Error::Kafka(_)));
        assert!(engine.is_halted().await);
        assert_eq!(engine.pending().await, 1);
        assert!(matches!(
            engine.health().status(Component::Kafka),
            ComponentStatus::Unhealthy(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_flushes_never_overlap() {
        let sink = Arc::new(RecordingSink::slow(Duration::from_millis(20)));
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(2, sink.clone(), committer.clone()));

        let mut tasks = Vec::new();
        for n in 0..8i64 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine.accumulate(point(n), 0, n).await;
                engine.flush().await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(sink.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(engine.pending().await, 0);
        let written: usize = sink.batch_sizes().iter().sum();
        assert_eq!(written, 8);
        let highest = committer
            .commits
            .lock()
            .iter()
            .flatten()
            .map(|(_, _, offset)| *offset)
            .max();
        assert_eq!(highest, Some(7));
    }

    #[tokio::test]
    async fn test_commit_resets_commit_clock() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = engine(1, sink, committer);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.since_last_commit().await >= Duration::from_millis(20));

        engine.accumulate(point(1), 0, 1).await;
        engine.flush().await.unwrap();
        assert!(engine.since_last_commit().await < Duration::from_millis(20));
    }
}
