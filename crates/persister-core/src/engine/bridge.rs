//! Routes transport callbacks into the flush engine.
//!
//! Repartition and commit-timeout notifications arrive outside the consume
//! loop. Both run the same [`FlushEngine::flush`] under the same lock as a
//! size-triggered flush. A fatal outcome cannot unwind through librdkafka,
//! so it is handed to the consume loop over a channel instead.

use super::flush::{FlushEngine, FlushOutcome};
use crate::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receiving half of the fatal-error channel, owned by the consume loop.
pub type FatalErrors = mpsc::UnboundedReceiver<Error>;

/// Handle given to the transport for callback-driven flushes.
///
/// Holds the engine weakly so the consumer context does not keep it alive.
/// Once the engine is dropped, callbacks are no-ops.
#[derive(Clone)]
pub struct CallbackBridge {
    engine: Weak<FlushEngine>,
    fatal_tx: mpsc::UnboundedSender<Error>,
}

impl CallbackBridge {
    /// Create a bridge for `engine` and the receiver for its fatal errors.
    pub fn new(engine: &Arc<FlushEngine>) -> (Self, FatalErrors) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        (
            Self {
                engine: Arc::downgrade(engine),
                fatal_tx,
            },
            fatal_rx,
        )
    }

    /// Flush on partition assignment or revocation.
    ///
    /// Called synchronously by librdkafka from inside the consumer poll, on
    /// a runtime worker thread. Blocks that thread until the flush is done so
    /// offsets of revoked partitions are committed before they move.
    pub fn on_repartition(&self) {
        let Some(engine) = self.engine.upgrade() else {
            debug!("Flush engine gone, ignoring repartition");
            return;
        };

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.report(
                    "repartition",
                    Err(Error::Config(format!(
                        "repartition callback outside a runtime: {}",
                        e
                    ))),
                );
                return;
            }
        };

        // block_in_place panics on the current-thread scheduler
        if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
            self.report(
                "repartition",
                Err(Error::Config(
                    "repartition flush requires the multi-threaded runtime".into(),
                )),
            );
            return;
        }

        let result = tokio::task::block_in_place(|| handle.block_on(engine.flush()));
        self.report("repartition", result);
    }

    /// Flush because offsets have not been committed for too long.
    pub async fn on_commit_timeout(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let result = engine.flush().await;
        self.report("commit timeout", result);
    }

    /// Whether the engine has gone at least `timeout` without a commit.
    async fn commit_overdue(&self, timeout: Duration) -> bool {
        match self.engine.upgrade() {
            Some(engine) => engine.since_last_commit().await >= timeout,
            None => false,
        }
    }

    fn report(&self, trigger: &'static str, result: Result<FlushOutcome>) {
        match result {
            Ok(FlushOutcome::Skipped) => debug!(trigger, "Nothing to flush"),
            Ok(outcome) => debug!(trigger, outcome = ?outcome, "Callback flush done"),
            // Already reported by whoever halted the engine
            Err(Error::Halted) => debug!(trigger, "Flush engine halted"),
            Err(e) => {
                error!(trigger, error = %e, "Callback flush failed");
                if self.fatal_tx.send(e).is_err() {
                    warn!(trigger, "Consume loop gone, fatal error not delivered");
                }
            }
        }
    }
}

/// Spawn the task that fires [`CallbackBridge::on_commit_timeout`] whenever
/// `timeout` has passed since the last commit. Stops on `shutdown`.
pub fn spawn_commit_timer(
    bridge: CallbackBridge,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let period = (timeout / 4).max(Duration::from_millis(10));

    tokio::spawn(async move {
        info!(
            timeout_ms = timeout.as_millis() as u64,
            "Commit timer started"
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if bridge.commit_overdue(timeout).await {
                        bridge.on_commit_timeout().await;
                    }
                }
            }
        }

        debug!("Commit timer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::flush::testing::*;
    use crate::error::StorageError;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repartition_flushes_pending_batch() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink.clone(), committer.clone()));
        let (bridge, mut fatal) = CallbackBridge::new(&engine);

        engine.accumulate(point(1), 0, 5).await;
        engine.accumulate(point(2), 1, 9).await;

        bridge.on_repartition();

        assert_eq!(engine.pending().await, 0);
        assert_eq!(sink.batch_sizes(), vec![2]);
        assert_eq!(
            committer.last(),
            Some(vec![("metrics".to_string(), 0, 5), ("metrics".to_string(), 1, 9)])
        );
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repartition_with_empty_buffer_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink.clone(), committer.clone()));
        let (bridge, mut fatal) = CallbackBridge::new(&engine);

        bridge.on_repartition();

        assert!(sink.batches.lock().is_empty());
        assert_eq!(committer.count(), 0);
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_callback_flush_reaches_consume_loop() {
        let sink = Arc::new(RecordingSink::failing_with(StorageError::Transport(
            "connection refused".into(),
        )));
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink, committer));
        let (bridge, mut fatal) = CallbackBridge::new(&engine);

        engine.accumulate(point(1), 0, 1).await;
        bridge.on_repartition();

        let err = fatal.recv().await.unwrap();
        assert!(matches!(err, Error::Storage(StorageError::Transport(_))));

        // Halted engine: later callbacks do not report again
        bridge.on_commit_timeout().await;
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repartition_on_current_thread_runtime_is_reported() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink.clone(), committer));
        let (bridge, mut fatal) = CallbackBridge::new(&engine);

        engine.accumulate(point(1), 0, 1).await;
        bridge.on_repartition();

        assert!(matches!(fatal.try_recv(), Ok(Error::Config(_))));
        assert_eq!(engine.pending().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_engine_makes_callbacks_noops() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink, committer));
        let (bridge, mut fatal) = CallbackBridge::new(&engine);
        drop(engine);

        bridge.on_repartition();
        bridge.on_commit_timeout().await;
        assert!(!bridge.commit_overdue(Duration::ZERO).await);
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commit_timer_flushes_idle_batch() {
        let sink = Arc::new(RecordingSink::default());
        let committer = Arc::new(RecordingCommitter::default());
        let engine = Arc::new(engine(100, sink.clone(), committer.clone()));
        let (bridge, _fatal) = CallbackBridge::new(&engine);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        engine.accumulate(point(1), 3, 42).await;
        let timer = spawn_commit_timer(bridge, Duration::from_millis(50), shutdown_rx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while engine.pending().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.pending().await, 0);
        assert_eq!(committer.last(), Some(vec![("metrics".to_string(), 3, 42)]));

        shutdown_tx.send(()).unwrap();
        timer.await.unwrap();
    }
}
