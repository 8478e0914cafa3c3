//! Error types for the persister core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Storage failures carry their own recoverable/fatal discriminant so the
//! flush engine never has to inspect error text.

use thiserror::Error;

/// Result type alias for persister operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the persister.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The flush engine stopped after a fatal failure
    #[error("Flush engine halted after a fatal error")]
    Halted,
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),
}

/// Outcome of a failed batch write, classified at the storage boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The backend accepted the batch but refused some points for policy
    /// reasons (e.g. older than the retention policy allows).
    #[error("Partial write ({dropped:?} points dropped): {message}")]
    PartialWrite {
        dropped: Option<u64>,
        message: String,
    },

    /// The backend refused the write
    #[error("Write rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The request never completed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The request timed out
    #[error("Write timed out: {0}")]
    Timeout(String),
}

impl StorageError {
    /// Whether the flush engine may drop the batch and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::PartialWrite { .. })
    }
}

/// Per-message conversion errors. These never leave the consume loop.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Message had no payload
    #[error("Message has no payload")]
    EmptyPayload,

    /// Payload is not UTF-8
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Payload is not the expected JSON document
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is missing or empty
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A field value cannot be stored
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_storage_error_classification() {
        let partial = StorageError::PartialWrite {
            dropped: Some(3),
            message: "points beyond retention policy dropped=3".into(),
        };
        assert!(partial.is_recoverable());

        let rejected = StorageError::Rejected {
            status: 500,
            message: "engine: cache maximum memory size exceeded".into(),
        };
        assert!(!rejected.is_recoverable());
        assert!(!StorageError::Transport("connection reset".into()).is_recoverable());
        assert!(!StorageError::Timeout("30s".into()).is_recoverable());
    }

    #[test]
    fn test_storage_error_wraps_into_top_level() {
        let err: Error = StorageError::Rejected {
            status: 400,
            message: "unable to parse".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Storage error: Write rejected with status 400: unable to parse"
        );
    }

    #[test]
    fn test_conversion_error() {
        let err = ConversionError::MissingField("metric.name");
        assert_eq!(err.to_string(), "Missing field: metric.name");
    }
}
