//! Metric envelope converter.

use super::{json_field, line_safe, payload, MessageConverter};
use crate::error::ConversionError;
use crate::kafka::KafkaMessage;
use crate::point::{DataPoint, FieldValue};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct MetricEnvelope {
    metric: Metric,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Metric {
    #[serde(default)]
    name: String,
    #[serde(default)]
    dimensions: BTreeMap<String, String>,
    timestamp: f64,
    value: f64,
    #[serde(default)]
    value_meta: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(rename = "tenantId", default)]
    tenant_id: String,
    #[serde(default)]
    region: String,
}

/// Converts `{"metric": {...}, "meta": {...}}` envelopes.
///
/// The metric name becomes the measurement, dimensions become tags along
/// with `_tenant_id` and `_region`, and the point carries `value` and the
/// JSON encoded `value_meta`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricConverter;

impl MessageConverter for MetricConverter {
    fn convert(&self, message: &KafkaMessage) -> Result<DataPoint, ConversionError> {
        let envelope: MetricEnvelope = serde_json::from_str(payload(message)?)?;
        let metric = envelope.metric;

        if metric.name.is_empty() {
            return Err(ConversionError::MissingField("metric.name"));
        }
        if !metric.value.is_finite() {
            return Err(ConversionError::InvalidValue {
                field: "metric.value",
                reason: format!("{} is not finite", metric.value),
            });
        }
        if !metric.timestamp.is_finite() || metric.timestamp < 0.0 {
            return Err(ConversionError::InvalidValue {
                field: "metric.timestamp",
                reason: format!("{} is not a valid epoch millisecond", metric.timestamp),
            });
        }

        line_safe("metric.name", &metric.name)?;
        line_safe("meta.tenantId", &envelope.meta.tenant_id)?;
        line_safe("meta.region", &envelope.meta.region)?;
        for (key, value) in &metric.dimensions {
            line_safe("metric.dimensions", key)?;
            line_safe("metric.dimensions", value)?;
        }

        let mut builder = DataPoint::builder(metric.name)
            .tag("_tenant_id", envelope.meta.tenant_id)
            .tag("_region", envelope.meta.region);
        for (key, value) in metric.dimensions {
            builder = builder.tag(key, value);
        }

        builder
            .field("value", FieldValue::Float(metric.value))
            .field(
                "value_meta",
                FieldValue::String(json_field(metric.value_meta.as_ref())),
            )
            .timestamp_ms(metric.timestamp as i64)
            .build()
            .ok_or(ConversionError::MissingField("metric.name"))
    }
}
