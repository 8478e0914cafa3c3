//! Alarm state transition converter.

use super::{json_field, line_safe, payload, MessageConverter};
use crate::error::ConversionError;
use crate::kafka::KafkaMessage;
use crate::point::{DataPoint, FieldValue};
use serde::Deserialize;

const MEASUREMENT: &str = "alarm_state_history";

#[derive(Debug, Deserialize)]
struct AlarmEnvelope {
    #[serde(rename = "alarm-transitioned")]
    transition: AlarmTransition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlarmTransition {
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    alarm_id: String,
    #[serde(default)]
    metrics: Option<serde_json::Value>,
    #[serde(default)]
    old_state: String,
    #[serde(default)]
    new_state: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    lifecycle_state: Option<String>,
    #[serde(default)]
    state_change_reason: String,
    #[serde(default)]
    sub_alarms: Option<serde_json::Value>,
    timestamp: i64,
}

/// Converts `{"alarm-transitioned": {...}}` events into
/// `alarm_state_history` points tagged by tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlarmStateHistoryConverter;

impl MessageConverter for AlarmStateHistoryConverter {
    fn convert(&self, message: &KafkaMessage) -> Result<DataPoint, ConversionError> {
        let envelope: AlarmEnvelope = serde_json::from_str(payload(message)?)?;
        let t = envelope.transition;

        if t.alarm_id.is_empty() {
            return Err(ConversionError::MissingField("alarmId"));
        }
        if t.new_state.is_empty() {
            return Err(ConversionError::MissingField("newState"));
        }

        line_safe("tenantId", &t.tenant_id)?;

        let sub_alarms = match t.sub_alarms {
            None | Some(serde_json::Value::Null) => "[]".to_string(),
            Some(v) => v.to_string(),
        };
        let metrics = match t.metrics {
            None | Some(serde_json::Value::Null) => "[]".to_string(),
            Some(v) => v.to_string(),
        };

        DataPoint::builder(MEASUREMENT)
            .tag("tenant_id", t.tenant_id.clone())
            .field("tenant_id", FieldValue::String(t.tenant_id))
            .field("alarm_id", FieldValue::String(t.alarm_id))
            .field("metrics", FieldValue::String(metrics))
            .field("new_state", FieldValue::String(t.new_state))
            .field("old_state", FieldValue::String(t.old_state))
            .field("link", FieldValue::String(t.link.unwrap_or_default()))
            .field(
                "lifecycle_state",
                FieldValue::String(t.lifecycle_state.unwrap_or_default()),
            )
            .field("reason", FieldValue::String(t.state_change_reason))
            .field("reason_data", FieldValue::String(json_field(None)))
            .field("sub_alarms", FieldValue::String(sub_alarms))
            .timestamp_ms(t.timestamp)
            .build()
            .ok_or(ConversionError::MissingField("alarm-transitioned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::message;

    #[test]
    fn test_convert_alarm_transition() {
        let msg = message(
            r#"{"alarm-transitioned": {
                "tenantId": "abc",
                "alarmId": "a-1",
                "alarmDefinitionId": "d-1",
                "metrics": [{"name": "cpu.idle_perc", "dimensions": {"hostname": "node-1"}}],
                "oldState": "OK",
                "newState": "ALARM",
                "link": null,
                "lifecycleState": "OPEN",
                "stateChangeReason": "Thresholds were exceeded",
                "severity": "HIGH",
                "subAlarms": [],
                "timestamp": 1500000000000
            }}"#,
        );

        let point = AlarmStateHistoryConverter.convert(&msg).unwrap();
        assert_eq!(point.measurement(), "alarm_state_history");
        assert_eq!(point.timestamp_ms(), 1_500_000_000_000);
        assert_eq!(point.tags().get("tenant_id").map(String::as_str), Some("abc"));

        let field = |name: &str| {
            point
                .fields()
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(field("new_state"), Some(FieldValue::String("ALARM".into())));
        assert_eq!(field("old_state"), Some(FieldValue::String("OK".into())));
        assert_eq!(field("link"), Some(FieldValue::String("".into())));
        assert_eq!(field("sub_alarms"), Some(FieldValue::String("[]".into())));
        assert_eq!(field("reason_data"), Some(FieldValue::String("{}".into())));
    }

    #[test]
    fn test_convert_alarm_missing_id() {
        let msg = message(r#"{"alarm-transitioned": {"newState": "OK", "timestamp": 1}}"#);
        assert!(matches!(
            AlarmStateHistoryConverter.convert(&msg),
            Err(ConversionError::MissingField("alarmId"))
        ));
    }

    #[test]
    fn test_convert_alarm_line_break_in_tenant() {
        let msg = message(
            r#"{"alarm-transitioned": {"tenantId": "abc\ndef", "alarmId": "a", "newState": "OK", "timestamp": 1}}"#,
        );
        assert!(matches!(
            AlarmStateHistoryConverter.convert(&msg),
            Err(ConversionError::InvalidValue { field: "tenantId", .. })
        ));
    }

    #[test]
    fn test_convert_wrong_envelope() {
        let msg = message(r#"{"alarm-created": {"alarmId": "a", "timestamp": 1}}"#);
        assert!(matches!(
            AlarmStateHistoryConverter.convert(&msg),
            Err(ConversionError::Malformed(_))
        ));
    }
}
