//! Main consume loop orchestration.
//!
//! Pulls messages from the transport, converts them, hands points to the
//! flush engine and flushes once the batch threshold is reached. Any error
//! that escapes the loop stops it; restarting is left to the supervisor.

use super::bridge::{spawn_commit_timer, CallbackBridge, FatalErrors};
use super::flush::FlushEngine;
use crate::config::Config;
use crate::convert::{self, MessageConverter};
use crate::health::{Component, HealthCheck};
use crate::kafka::{KafkaConsumerBuilder, KafkaMessage, MessageSource, SmartKafkaConsumer};
use crate::metrics::PersisterMetrics;
use crate::sink::InfluxDbSink;
use crate::{Error, Result};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Consume loop over a message source.
pub struct Persister<S: MessageSource> {
    source: S,
    converter: Box<dyn MessageConverter>,
    engine: Arc<FlushEngine>,
    bridge: CallbackBridge,
    fatal_rx: FatalErrors,
    commit_timeout: Option<Duration>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Persister<SmartKafkaConsumer> {
    /// Wire the Kafka consumer, the InfluxDB sink and the flush engine
    /// together from configuration. Metrics are registered in `registry`.
    pub fn from_config(config: &Config, registry: Registry) -> Result<Self> {
        config.validate()?;

        let consumer = KafkaConsumerBuilder::new(config.kafka.clone()).build()?;
        let sink = Arc::new(InfluxDbSink::new(config.influxdb.clone())?);
        let metrics = Arc::new(PersisterMetrics::new(registry)?);
        let health = Arc::new(HealthCheck::new());

        let engine = Arc::new(FlushEngine::new(
            config.kafka.topic.clone(),
            config.kafka.batch_size,
            sink,
            Arc::new(consumer.committer()),
            metrics,
            health,
        ));

        let (bridge, fatal_rx) = CallbackBridge::new(&engine);
        consumer.attach_bridge(bridge.clone());

        info!(
            topic = %config.kafka.topic,
            batch_size = config.kafka.batch_size,
            commit_timeout_s = config.kafka.max_wait_time_seconds,
            message_kind = ?config.persister.message_kind,
            database = %config.influxdb.database,
            "Persister initialized"
        );

        Ok(Self::new(
            consumer,
            convert::for_kind(config.persister.message_kind),
            engine,
            bridge,
            fatal_rx,
        )
        .with_commit_timeout(config.kafka.commit_timeout()))
    }
}

impl<S: MessageSource> Persister<S> {
    /// Assemble a loop from its parts. `bridge` and `fatal_rx` must come from
    /// [`CallbackBridge::new`] for the same `engine`.
    pub fn new(
        source: S,
        converter: Box<dyn MessageConverter>,
        engine: Arc<FlushEngine>,
        bridge: CallbackBridge,
        fatal_rx: FatalErrors,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            source,
            converter,
            engine,
            bridge,
            fatal_rx,
            commit_timeout: None,
            shutdown_tx,
        }
    }

    /// Force a flush whenever `timeout` passes without a commit.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// Run until shutdown, source exhaustion or a fatal error.
    ///
    /// Shutdown and exhaustion attempt one final flush. A fatal error is
    /// returned as is, with no further flush.
    pub async fn run(&mut self) -> Result<()> {
        let health = Arc::clone(self.engine.health());
        health.set_running(true);
        info!(
            topic = %self.engine.topic(),
            batch_size = self.engine.batch_size(),
            "Persister started"
        );

        let timer = self.commit_timeout.map(|timeout| {
            spawn_commit_timer(self.bridge.clone(), timeout, self.shutdown_tx.subscribe())
        });
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            tokio::select! {
                biased;

                Some(e) = self.fatal_rx.recv() => {
                    break Err(e);
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break self.final_flush().await;
                }

                next = self.source.next_message() => match next {
                    None => {
                        info!("Message source exhausted");
                        break self.final_flush().await;
                    }
                    Some(Err(e)) => {
                        health.mark_unhealthy(Component::Kafka, &format!("Poll failed: {}", e));
                        break Err(e);
                    }
                    Some(Ok(message)) => {
                        health.mark_healthy(Component::Kafka);
                        if let Err(e) = self.handle_message(message).await {
                            break Err(self.first_fatal(e));
                        }
                    }
                }
            }
        };

        // Stops the commit timer
        let _ = self.shutdown_tx.send(());
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Commit timer task failed");
            }
        }
        health.set_running(false);

        match result {
            Ok(()) => {
                info!("Persister stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Persister stopped on fatal error");
                Err(e)
            }
        }
    }

    async fn handle_message(&self, message: KafkaMessage) -> Result<()> {
        match self.converter.convert(&message) {
            Ok(point) => {
                let pending = self
                    .engine
                    .accumulate(point, message.partition, message.offset)
                    .await;
                if pending >= self.engine.batch_size() {
                    self.engine.flush().await?;
                }
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    message = %message.value_lossy(),
                    "Error processing message. Message is being dropped."
                );
                self.engine.metrics().record_dropped(&message.topic);
                self.engine.skip(message.partition, message.offset).await;
            }
        }
        Ok(())
    }

    /// A callback flush may halt the engine while a message is in hand. The
    /// loop then only sees [`Error::Halted`], and the error that caused it is
    /// still queued on the fatal channel.
    fn first_fatal(&mut self, e: Error) -> Error {
        match e {
            Error::Halted => self.fatal_rx.try_recv().unwrap_or(Error::Halted),
            e => e,
        }
    }

    async fn final_flush(&self) -> Result<()> {
        let pending = self.engine.pending().await;
        debug!(pending, "Final flush before shutdown");
        self.engine.flush().await.map(|_| ())
    }

    /// Sender that stops the loop gracefully when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn engine(&self) -> &Arc<FlushEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<PersisterMetrics> {
        self.engine.metrics()
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        self.engine.health()
    }
}
