//! Kafka consumer with rebalance callbacks and manual offset commits.

mod consumer;
mod offset;
mod transport;

pub use consumer::{
    KafkaCommitter, KafkaConsumerBuilder, KafkaMessage, PersisterContext, SmartKafkaConsumer,
};
pub use offset::OffsetTracker;
pub use transport::{MessageSource, OffsetCommitter};
