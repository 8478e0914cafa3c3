//! InfluxDB 1.x HTTP write adapter.
//!
//! Points are posted as line protocol to `/write` with millisecond
//! precision. A `partial write` response whose error reports points beyond
//! the retention policy is turned into [`StorageError::PartialWrite`]; every
//! other non-success response is fatal.

use super::StorageSink;
use crate::config::InfluxDbConfig;
use crate::error::StorageError;
use crate::point::{to_line_protocol_body, DataPoint};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const PARTIAL_WRITE: &str = "partial write";
const BEYOND_RETENTION_POLICY: &str = "points beyond retention policy dropped";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Writes batches to an InfluxDB database over HTTP.
pub struct InfluxDbSink {
    client: reqwest::Client,
    write_url: String,
    config: InfluxDbConfig,
}

impl InfluxDbSink {
    /// Create a sink for the configured server and database.
    pub fn new(config: InfluxDbConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let write_url = format!("{}/write", config.url.trim_end_matches('/'));

        Ok(Self {
            client,
            write_url,
            config,
        })
    }

    fn query(&self) -> Vec<(&'static str, &str)> {
        let mut query = vec![("db", self.config.database.as_str()), ("precision", "ms")];
        if let Some(ref rp) = self.config.retention_policy {
            query.push(("rp", rp.as_str()));
        }
        query
    }
}

#[async_trait]
impl StorageSink for InfluxDbSink {
    async fn write_batch(
        &self,
        points: &[DataPoint],
        topic: &str,
    ) -> std::result::Result<(), StorageError> {
        let mut request = self
            .client
            .post(&self.write_url)
            .query(&self.query())
            .body(to_line_protocol_body(points));

        if let Some(ref username) = self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            debug!(
                topic = %topic,
                points = points.len(),
                database = %self.config.database,
                "Batch written"
            );
            return Ok(());
        }

        let text = response.text().await.map_err(transport_error)?;
        Err(classify_failure(status.as_u16(), &text))
    }
}

fn transport_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() {
        StorageError::Timeout(err.to_string())
    } else {
        StorageError::Transport(err.to_string())
    }
}

/// Map a failed response onto the storage error taxonomy.
fn classify_failure(status: u16, body: &str) -> StorageError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());

    if message.starts_with(PARTIAL_WRITE) && message.contains(BEYOND_RETENTION_POLICY) {
        return StorageError::PartialWrite {
            dropped: dropped_count(&message),
            message,
        };
    }

    StorageError::Rejected { status, message }
}

/// Parse the `dropped=N` suffix InfluxDB appends to partial write errors.
fn dropped_count(message: &str) -> Option<u64> {
    let (_, rest) = message.split_once("dropped=")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
