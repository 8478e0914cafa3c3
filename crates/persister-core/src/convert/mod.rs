//! Conversion of raw Kafka messages into data points.
//!
//! Every failure here is local to one message: the consume loop logs it,
//! drops the message and moves on.

mod alarm;
mod metric;

pub use alarm::AlarmStateHistoryConverter;
pub use metric::MetricConverter;

use crate::config::MessageKind;
use crate::error::ConversionError;
use crate::kafka::KafkaMessage;
use crate::point::DataPoint;

/// Turns one raw message into one point.
pub trait MessageConverter: Send + Sync {
    fn convert(&self, message: &KafkaMessage) -> Result<DataPoint, ConversionError>;
}

/// Converter for the configured message kind.
pub fn for_kind(kind: MessageKind) -> Box<dyn MessageConverter> {
    match kind {
        MessageKind::Metrics => Box::new(MetricConverter),
        MessageKind::AlarmStateHistory => Box::new(AlarmStateHistoryConverter),
    }
}

/// Borrow the payload as UTF-8 text.
fn payload(message: &KafkaMessage) -> Result<&str, ConversionError> {
    match message.value.as_deref() {
        None | Some([]) => Err(ConversionError::EmptyPayload),
        Some(bytes) => Ok(std::str::from_utf8(bytes)?),
    }
}

/// Serialize an optional JSON value for storage in a string field. Absent,
/// null and empty values become `{}`.
fn json_field(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "{}".to_string(),
        Some(serde_json::Value::Object(map)) if map.is_empty() => "{}".to_string(),
        Some(v) => v.to_string(),
    }
}

/// Reject text that cannot sit unquoted in a line protocol line: a line
/// break splits the point, and a trailing backslash escapes the separator
/// that follows it.
fn line_safe(field: &'static str, text: &str) -> Result<(), ConversionError> {
    if text.contains(['\n', '\r']) {
        return Err(ConversionError::InvalidValue {
            field,
            reason: format!("{:?} contains a line break", text),
        });
    }
    if text.ends_with('\\') {
        return Err(ConversionError::InvalidValue {
            field,
            reason: format!("{:?} ends with a backslash", text),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn message(payload: &str) -> KafkaMessage {
    KafkaMessage {
        key: None,
        value: Some(payload.as_bytes().to_vec()),
        topic: "metrics".into(),
        partition: 0,
        offset: 0,
        timestamp: 0,
    }
}
