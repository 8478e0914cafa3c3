//! Kafka consumer with rebalance callbacks.
//!
//! Offsets are committed manually and synchronously, only after the flush
//! engine has durably written the batch they cover. Partition reassignment
//! is observed through [`PersisterContext`], which routes it into the same
//! flush path the consume loop uses.

use super::transport::{MessageSource, OffsetCommitter};
use crate::config::KafkaConfig;
use crate::engine::CallbackBridge;
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Consumer context that forwards rebalance events to the callback bridge.
///
/// librdkafka invokes `pre_rebalance` from inside the consumer's poll, i.e.
/// while the consume loop is awaiting the next message and does not hold the
/// buffer lock.
#[derive(Default)]
pub struct PersisterContext {
    bridge: OnceLock<CallbackBridge>,
}

impl PersisterContext {
    /// Attach the bridge. Only the first call has an effect.
    pub fn attach(&self, bridge: CallbackBridge) {
        if self.bridge.set(bridge).is_err() {
            warn!("Callback bridge already attached to consumer context");
        }
    }
}

impl ClientContext for PersisterContext {}

impl ConsumerContext for PersisterContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let (phase, partitions) = match rebalance {
            Rebalance::Assign(tpl) => ("assign", tpl.count()),
            Rebalance::Revoke(tpl) => ("revoke", tpl.count()),
            Rebalance::Error(e) => {
                warn!(error = %e, "Rebalance error reported by Kafka");
                return;
            }
        };

        info!(phase, partitions, "Partition repartition, flushing pending batch");

        match self.bridge.get() {
            Some(bridge) => bridge.on_repartition(),
            None => debug!("Repartition before bridge attached, nothing to flush"),
        }
    }
}

/// Builder for creating a Kafka consumer.
pub struct KafkaConsumerBuilder {
    config: KafkaConfig,
}

impl KafkaConsumerBuilder {
    /// Create a new consumer builder.
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// Build the consumer and subscribe to the configured topic.
    pub fn build(self) -> Result<SmartKafkaConsumer> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            // Manual commits only - offsets advance after a durable write
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                match self.config.auto_offset_reset {
                    crate::config::OffsetReset::Earliest => "earliest",
                    crate::config::OffsetReset::Latest => "latest",
                },
            )
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            // max.poll.interval.ms must exceed the longest write, the loop
            // does not poll while a flush is in flight
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(ref protocol) = self.config.security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.config.security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.config.security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = self.config.security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = self.config.security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().into_owned());
        }

        let consumer: StreamConsumer<PersisterContext> = client_config
            .create_with_context(PersisterContext::default())
            .map_err(|e| {
                Error::Kafka(KafkaError::ConnectionFailed {
                    broker: self.config.bootstrap_servers.join(","),
                    message: e.to_string(),
                })
            })?;

        consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        info!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            servers = %self.config.bootstrap_servers.join(","),
            "Kafka consumer subscribed"
        );

        Ok(SmartKafkaConsumer {
            consumer: Arc::new(consumer),
        })
    }
}

/// Kafka consumer feeding the consume loop.
pub struct SmartKafkaConsumer {
    consumer: Arc<StreamConsumer<PersisterContext>>,
}

impl SmartKafkaConsumer {
    /// Route rebalance notifications into `bridge`.
    pub fn attach_bridge(&self, bridge: CallbackBridge) {
        self.consumer.context().attach(bridge);
    }

    /// Committer sharing this consumer's group membership.
    pub fn committer(&self) -> KafkaCommitter {
        KafkaCommitter {
            consumer: Arc::clone(&self.consumer),
        }
    }

    /// Convert a borrowed message to an owned KafkaMessage.
    fn convert_message(msg: &BorrowedMessage<'_>) -> KafkaMessage {
        KafkaMessage {
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis().unwrap_or(0),
        }
    }
}

#[async_trait]
impl MessageSource for SmartKafkaConsumer {
    async fn next_message(&mut self) -> Option<Result<KafkaMessage>> {
        let result = match self.consumer.recv().await {
            Ok(msg) => Ok(Self::convert_message(&msg)),
            Err(e) => Err(Error::Kafka(KafkaError::ConsumerGroup(e.to_string()))),
        };
        Some(result)
    }
}

/// Commits offsets through the shared consumer handle.
#[derive(Clone)]
pub struct KafkaCommitter {
    consumer: Arc<StreamConsumer<PersisterContext>>,
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();

        for (topic, partition, offset) in offsets {
            // Kafka convention: the committed offset is the next one to read
            tpl.add_partition_offset(topic, *partition, rdkafka::Offset::Offset(offset + 1))
                .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;

        debug!(offsets = ?offsets, "Offsets committed");

        Ok(())
    }
}

/// A Kafka message with the metadata the persister needs.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message value (optional)
    pub value: Option<Vec<u8>>,

    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message timestamp (milliseconds since epoch)
    pub timestamp: i64,
}

impl KafkaMessage {
    /// Get the message key as a string.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Get the message value as a string, lossily, for logging.
    pub fn value_lossy(&self) -> String {
        self.value
            .as_deref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    }
}
