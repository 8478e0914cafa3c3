//! Configuration structures for the persister.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Every value is read once at startup and treated as immutable afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,

    /// InfluxDB configuration
    pub influxdb: InfluxDbConfig,

    /// Message handling configuration
    #[serde(default)]
    pub persister: PersisterConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    pub topic: String,

    /// Consumer group ID
    pub consumer_group: String,

    /// Number of points that triggers a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between offset commits before a flush is forced
    #[serde(default = "default_max_wait_time_seconds")]
    pub max_wait_time_seconds: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Max poll interval in milliseconds (must exceed the longest write)
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

impl KafkaConfig {
    /// Commit timeout as a duration.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_seconds)
    }
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// InfluxDB (1.x HTTP API) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxDbConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,

    /// Database name
    pub database: String,

    /// Retention policy to write into (server default when unset)
    pub retention_policy: Option<String>,

    /// Username
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

/// Which kind of message the topic carries.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Metric envelopes
    #[default]
    Metrics,
    /// Alarm state transitions
    AlarmStateHistory,
}

/// Message handling configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersisterConfig {
    /// Kind of message on the topic; selects the converter
    #[serde(default)]
    pub message_kind: MessageKind,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string for an `EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_batch_size() -> usize {
    1000
}
fn default_max_wait_time_seconds() -> u64 {
    30
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_heartbeat_interval_ms() -> u32 {
    3000
}
fn default_max_poll_interval_ms() -> u32 {
    300000 // 5 minutes - must exceed longest write
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.kafka.topic.is_empty() {
            return Err(crate::Error::Config("Kafka topic is required".into()));
        }

        if self.kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if self.kafka.batch_size == 0 {
            return Err(crate::Error::Config(
                "Batch size must be at least 1".into(),
            ));
        }

        if self.kafka.max_wait_time_seconds == 0 {
            return Err(crate::Error::Config(
                "max_wait_time_seconds must be at least 1".into(),
            ));
        }

        if self.influxdb.url.is_empty() {
            return Err(crate::Error::Config("InfluxDB url is required".into()));
        }

        if self.influxdb.database.is_empty() {
            return Err(crate::Error::Config(
                "InfluxDB database is required".into(),
            ));
        }

        if u64::from(self.kafka.max_poll_interval_ms) < self.influxdb.request_timeout_seconds * 1000
        {
            tracing::warn!(
                max_poll_interval_ms = self.kafka.max_poll_interval_ms,
                request_timeout_seconds = self.influxdb.request_timeout_seconds,
                "A slow write may exceed max.poll.interval.ms and trigger a rebalance"
            );
        }

        Ok(())
    }
}
