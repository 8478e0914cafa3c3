//! Prometheus metrics export.
//!
//! Metrics live in a [`Registry`] handed in by the caller rather than the
//! process-wide default registry, so tests can build as many independent
//! instances as they like.

use crate::Result;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Label value for the versioned message counter.
pub const MESSAGE_FORMAT_VERSION: &str = "v1.0";

/// Persister metrics. Counters are monotonic; gauges hold the values from
/// the most recent successful flush.
pub struct PersisterMetrics {
    registry: Registry,

    // === COUNTERS ===
    /// Points written, labeled by message format version
    messages_total: IntCounterVec,

    /// Points written, labeled by source topic
    messages_per_topic: IntCounterVec,

    /// Messages dropped because they could not be converted
    dropped_messages: IntCounterVec,

    /// Batches the backend only partially accepted
    partial_writes: IntCounterVec,

    // === GAUGES ===
    /// Points per second over the window since the previous flush
    messages_per_second: GaugeVec,

    /// Storage write time divided by batch size
    write_latency_seconds: GaugeVec,
}

impl PersisterMetrics {
    /// Create metrics and register them with `registry`.
    pub fn new(registry: Registry) -> Result<Self> {
        let messages_total = IntCounterVec::new(
            Opts::new("persister_messages_total", "Total count of messages"),
            &["version"],
        )?;
        let messages_per_topic = IntCounterVec::new(
            Opts::new(
                "persister_messages_per_topic_total",
                "Total number of messages processed from one topic",
            ),
            &["topic"],
        )?;
        let dropped_messages = IntCounterVec::new(
            Opts::new(
                "persister_dropped_messages_total",
                "Messages dropped because they could not be converted",
            ),
            &["topic"],
        )?;
        let partial_writes = IntCounterVec::new(
            Opts::new(
                "persister_partial_writes_total",
                "Batches with points refused by the retention policy",
            ),
            &["topic"],
        )?;
        let messages_per_second = GaugeVec::new(
            Opts::new(
                "persister_messages_per_second",
                "Messages processed per second from one topic",
            ),
            &["topic"],
        )?;
        let write_latency_seconds = GaugeVec::new(
            Opts::new(
                "persister_write_latency_seconds",
                "Seconds per message for the storage backend to write",
            ),
            &["topic"],
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(messages_per_topic.clone()))?;
        registry.register(Box::new(dropped_messages.clone()))?;
        registry.register(Box::new(partial_writes.clone()))?;
        registry.register(Box::new(messages_per_second.clone()))?;
        registry.register(Box::new(write_latency_seconds.clone()))?;

        // Export the versioned series at zero before the first flush
        messages_total.with_label_values(&[MESSAGE_FORMAT_VERSION]);

        Ok(Self {
            registry,
            messages_total,
            messages_per_topic,
            dropped_messages,
            partial_writes,
            messages_per_second,
            write_latency_seconds,
        })
    }

    // === RECORDING ===

    /// Record a successful flush of `count` points.
    ///
    /// `write_duration` is how long the storage write took; `rate` is the
    /// throughput the flush engine computed for the window.
    pub fn record_flush(&self, topic: &str, count: usize, write_duration: Duration, rate: f64) {
        if count == 0 {
            return;
        }
        self.messages_total
            .with_label_values(&[MESSAGE_FORMAT_VERSION])
            .inc_by(count as u64);
        self.messages_per_topic
            .with_label_values(&[topic])
            .inc_by(count as u64);
        self.messages_per_second
            .with_label_values(&[topic])
            .set(rate);
        self.write_latency_seconds
            .with_label_values(&[topic])
            .set(write_duration.as_secs_f64() / count as f64);
    }

    /// Record a message dropped by the converter.
    pub fn record_dropped(&self, topic: &str) {
        self.dropped_messages.with_label_values(&[topic]).inc();
    }

    /// Record a batch the backend only partially accepted.
    pub fn record_partial_write(&self, topic: &str) {
        self.partial_writes.with_label_values(&[topic]).inc();
    }

    // === GETTERS ===

    pub fn messages_total(&self) -> u64 {
        self.messages_total
            .with_label_values(&[MESSAGE_FORMAT_VERSION])
            .get()
    }

    pub fn messages_for_topic(&self, topic: &str) -> u64 {
        self.messages_per_topic.with_label_values(&[topic]).get()
    }

    pub fn dropped_messages(&self, topic: &str) -> u64 {
        self.dropped_messages.with_label_values(&[topic]).get()
    }

    pub fn partial_writes(&self, topic: &str) -> u64 {
        self.partial_writes.with_label_values(&[topic]).get()
    }

    pub fn messages_per_second(&self, topic: &str) -> f64 {
        self.messages_per_second.with_label_values(&[topic]).get()
    }

    pub fn write_latency_seconds(&self, topic: &str) -> f64 {
        self.write_latency_seconds.with_label_values(&[topic]).get()
    }

    /// Get the registry the metrics are registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use persister_core::metrics::{PersisterMetrics, Registry};
    ///
    /// let metrics = PersisterMetrics::new(Registry::new()).unwrap();
    /// metrics.record_dropped("metrics");
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("persister_dropped_messages_total{topic=\"metrics\"} 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let mut buffer = Vec::with_capacity(4096);
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
