//! Deserialized pipeline rows

use bytes::Bytes;
use serde_json::Value;

use super::Header;

/// Structured payload handed to pipelines.
///
/// Values are tagged rather than dynamically typed: a topic's deserializer
/// decides once, at registration time, whether its records are opaque bytes
/// or parsed JSON documents.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    /// Absent payload (tombstone)
    Null,
    /// Opaque bytes passed through untouched
    Bytes(Bytes),
    /// Parsed JSON document
    Json(Value),
}

impl RowValue {
    /// The parsed JSON document, if this value carries one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RowValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// String view: a JSON string or UTF-8 bytes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RowValue::Json(Value::String(s)) => Some(s),
            RowValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }
}

impl From<Value> for RowValue {
    fn from(value: Value) -> Self {
        RowValue::Json(value)
    }
}

impl From<Bytes> for RowValue {
    fn from(value: Bytes) -> Self {
        RowValue::Bytes(value)
    }
}

/// Routing metadata of the broker message a row came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Source offset
    pub offset: i64,
    /// Wire size of the source message in bytes
    pub size: usize,
}

/// A deserialized message payload flowing through the pipeline
///
/// Rows are immutable from the pipeline's perspective; transforms yield new
/// rows via [`Row::with_value`].
#[derive(Debug, Clone)]
pub struct Row {
    /// Structured value
    pub value: RowValue,
    /// Raw message key
    pub key: Option<Bytes>,
    /// Event timestamp (milliseconds since epoch)
    pub timestamp: i64,
    /// Ordered headers
    pub headers: Vec<Header>,
    context: MessageContext,
}

impl Row {
    pub fn new(
        value: RowValue,
        key: Option<Bytes>,
        timestamp: i64,
        headers: Vec<Header>,
        context: MessageContext,
    ) -> Self {
        Self {
            value,
            key,
            timestamp,
            headers,
            context,
        }
    }

    pub fn topic(&self) -> &str {
        &self.context.topic
    }

    pub fn partition(&self) -> i32 {
        self.context.partition
    }

    pub fn offset(&self) -> i64 {
        self.context.offset
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// A new row with the same routing metadata and a different value.
    pub fn with_value(&self, value: RowValue) -> Self {
        Self {
            value,
            key: self.key.clone(),
            timestamp: self.timestamp,
            headers: self.headers.clone(),
            context: self.context.clone(),
        }
    }

    /// A new row re-keyed for a downstream repartition topic.
    pub fn with_key(&self, key: Option<Bytes>) -> Self {
        Self {
            value: self.value.clone(),
            key,
            timestamp: self.timestamp,
            headers: self.headers.clone(),
            context: self.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> MessageContext {
        MessageContext {
            topic: "words".to_string(),
            partition: 0,
            offset: 7,
            size: 12,
        }
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(
            RowValue::Json(json!({"n": 1})),
            Some(Bytes::from_static(b"k")),
            1_700_000_000_000,
            Vec::new(),
            context(),
        );
        assert_eq!(row.topic(), "words");
        assert_eq!(row.partition(), 0);
        assert_eq!(row.offset(), 7);
        assert_eq!(row.value.as_json().unwrap()["n"], 1);
    }

    #[test]
    fn test_with_value_keeps_context() {
        let row = Row::new(RowValue::Null, None, 0, Vec::new(), context());
        let mapped = row.with_value(RowValue::Json(json!("x")));
        assert_eq!(mapped.offset(), 7);
        assert_eq!(mapped.value.as_str(), Some("x"));
    }

    #[test]
    fn test_row_value_as_str() {
        assert_eq!(
            RowValue::Bytes(Bytes::from_static(b"abc")).as_str(),
            Some("abc")
        );
        assert_eq!(RowValue::Json(json!("abc")).as_str(), Some("abc"));
        assert_eq!(RowValue::Json(json!(1)).as_str(), None);
        assert_eq!(RowValue::Null.as_str(), None);
        assert!(RowValue::Null.is_null());
    }
}
