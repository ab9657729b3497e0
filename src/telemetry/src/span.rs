//! The span model and its wire representation.
//!
//! `SpanRecord` is both the in-memory form of a finished span and the JSON
//! object shipped inside a `BatchEnvelope`; the server ingest deserializes
//! the exact same type. Attribute and event growth is bounded per span so a
//! hostile or buggy caller cannot grow memory without limit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::{SpanId, TraceId};

/// Maximum length of a span name.
pub const MAX_NAME_LEN: usize = 128;
/// Maximum length of a status message.
pub const MAX_STATUS_MESSAGE_LEN: usize = 512;
/// Maximum number of attributes per span.
pub const MAX_ATTRIBUTES_PER_SPAN: usize = 64;
/// Maximum serialized size of a span's attributes, in bytes.
pub const MAX_ATTRIBUTE_BYTES: usize = 4096;
/// Maximum number of events per span.
pub const MAX_EVENTS_PER_SPAN: usize = 32;

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Cancelled,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        Self::I64(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A timestamped event within a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEventRecord {
    pub timestamp_ms: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A finished span, in the shape defined by the batch envelope wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEventRecord>,
}

impl SpanRecord {
    /// Derived duration; non-negative by the `end >= start` invariant.
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Serialized size of the attribute map, in bytes.
    pub fn attribute_bytes(&self) -> usize {
        attribute_bytes(&self.attributes)
    }
}

/// Serialized size of an attribute map. Used to enforce the per-span byte cap
/// on both the recording and ingest sides.
pub fn attribute_bytes(attributes: &BTreeMap<String, AttributeValue>) -> usize {
    serde_json::to_vec(attributes).map(|v| v.len()).unwrap_or(0)
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_lossy(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_span() -> SpanRecord {
        SpanRecord {
            trace_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            span_id: "1111111111111111".parse().unwrap(),
            parent_span_id: None,
            name: "plugin.upload_audio".to_string(),
            start_time_ms: 1_000,
            end_time_ms: 4_000,
            status: SpanStatus::Ok,
            status_message: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn duration_is_end_minus_start() {
        assert_eq!(sample_span().duration_ms(), 3_000);
    }

    #[test]
    fn wire_shape_matches_envelope_schema() {
        let mut span = sample_span();
        span.attributes
            .insert("audio.sample_rate".into(), 48_000i64.into());
        span.events.push(SpanEventRecord {
            timestamp_ms: 2_000,
            name: "upload.started".into(),
            attributes: BTreeMap::new(),
        });

        let value = serde_json::to_value(&span).unwrap();
        assert_eq!(value["trace_id"], "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(value["span_id"], "1111111111111111");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["attributes"]["audio.sample_rate"], 48_000);
        assert_eq!(value["events"][0]["name"], "upload.started");
        // Optional fields are omitted, not null.
        assert!(value.get("parent_span_id").is_none());
        assert!(value.get("status_message").is_none());
    }

    #[test]
    fn attribute_values_deserialize_untagged() {
        let json = r#"{"a": true, "b": 7, "c": 1.5, "d": "x"}"#;
        let map: BTreeMap<String, AttributeValue> = serde_json::from_str(json).unwrap();
        assert_eq!(map["a"], AttributeValue::Bool(true));
        assert_eq!(map["b"], AttributeValue::I64(7));
        assert_eq!(map["c"], AttributeValue::F64(1.5));
        assert_eq!(map["d"], AttributeValue::String("x".into()));
    }

    #[test]
    fn attribute_bytes_counts_serialized_size() {
        let mut map = BTreeMap::new();
        assert_eq!(attribute_bytes(&map), 2); // "{}"
        map.insert("k".to_string(), AttributeValue::String("v".into()));
        assert!(attribute_bytes(&map) > 2);
    }
}
