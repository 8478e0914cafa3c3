//! Structured data points and their line protocol rendering.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
//! ```
//!
//! The flush engine never looks inside a [`DataPoint`]; only the converters
//! build them and only the storage sink renders them.

use std::collections::BTreeMap;
use std::fmt;

/// A value that can be stored in a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::String(v) => {
                write!(f, "\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
            }
            FieldValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// One structured record destined for the storage backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: Vec<(String, FieldValue)>,
    timestamp_ms: i64,
}

impl DataPoint {
    /// Start building a point for `measurement`.
    pub fn builder(measurement: impl Into<String>) -> DataPointBuilder {
        DataPointBuilder {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: Vec::new(),
            timestamp_ms: 0,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Render as a single line protocol line (millisecond precision, no
    /// trailing newline).
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        // BTreeMap keeps tags sorted, which is the canonical form.
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_string());
        }

        line.push(' ');
        line.push_str(&self.timestamp_ms.to_string());
        line
    }
}

/// Builder for [`DataPoint`].
#[derive(Debug)]
pub struct DataPointBuilder {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: Vec<(String, FieldValue)>,
    timestamp_ms: i64,
}

impl DataPointBuilder {
    /// Add a tag. Tags with empty keys or values are skipped, the backend
    /// rejects them.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        if !key.is_empty() && !value.is_empty() {
            self.tags.insert(key, value);
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Finish the point. Returns `None` when the point has no measurement or
    /// no fields, neither of which the backend can store.
    pub fn build(self) -> Option<DataPoint> {
        if self.measurement.is_empty() || self.fields.is_empty() {
            return None;
        }
        Some(DataPoint {
            measurement: self.measurement,
            tags: self.tags,
            fields: self.fields,
            timestamp_ms: self.timestamp_ms,
        })
    }
}

/// Render a batch as a newline separated request body.
pub fn to_line_protocol_body(points: &[DataPoint]) -> String {
    let mut body = String::with_capacity(points.len() * 128);
    for point in points {
        body.push_str(&point.to_line_protocol());
        body.push('\n');
    }
    body
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}
