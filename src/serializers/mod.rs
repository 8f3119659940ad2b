//! Value (de)serialization
//!
//! Topics carry a serializer/deserializer pair chosen at registration time.
//! Deserializers return a sum type rather than throwing: a message either
//! yields one or more values, or asks to be skipped. The skip signal
//! advances the offset without invoking the pipeline, distinct from failure.

use bytes::Bytes;

use crate::error::SerializationError;
use crate::model::{Header, RowValue};

mod json;

pub use json::{JsonDeserializer, JsonSerializer};

/// Context handed to serializers: where the message is going
#[derive(Debug, Clone, Copy)]
pub struct SerializationContext<'a> {
    /// Destination topic
    pub topic: &'a str,
    /// Destination partition, when already known
    pub partition: Option<i32>,
    /// Headers attached to the message
    pub headers: &'a [Header],
}

/// Context handed to deserializers: where the message came from
#[derive(Debug, Clone, Copy)]
pub struct DeserializationContext<'a> {
    /// Source topic
    pub topic: &'a str,
    /// Source partition
    pub partition: i32,
    /// Headers of the raw message
    pub headers: &'a [Header],
    /// Raw message key
    pub key: Option<&'a [u8]>,
}

/// Outcome of deserializing one message
#[derive(Debug, Clone, PartialEq)]
pub enum DeserializeOutcome {
    /// One message produced one or more values (array fan-out)
    Values(Vec<RowValue>),
    /// Ignore this message: advance the offset, do not invoke the pipeline
    Skip,
}

impl DeserializeOutcome {
    /// Single-value convenience constructor.
    pub fn value(value: RowValue) -> Self {
        DeserializeOutcome::Values(vec![value])
    }
}

/// Turns raw message bytes into structured values
pub trait Deserializer: Send + Sync {
    fn deserialize(
        &self,
        data: &[u8],
        ctx: &DeserializationContext<'_>,
    ) -> Result<DeserializeOutcome, SerializationError>;
}

/// Turns structured values into raw message bytes
pub trait Serializer: Send + Sync {
    fn serialize(
        &self,
        value: &RowValue,
        ctx: &SerializationContext<'_>,
    ) -> Result<Bytes, SerializationError>;
}

/// Derives a row timestamp from the deserialized value
pub trait TimestampExtractor: Send + Sync {
    /// `broker_timestamp` is the timestamp recorded by the broker.
    fn extract(&self, value: &RowValue, broker_timestamp: i64) -> i64;
}

/// Default extractor: the broker timestamp as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerTimestampExtractor;

impl TimestampExtractor for BrokerTimestampExtractor {
    fn extract(&self, _value: &RowValue, broker_timestamp: i64) -> i64 {
        broker_timestamp
    }
}

/// Opaque bytes pass-through
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDeserializer;

impl Deserializer for BytesDeserializer {
    fn deserialize(
        &self,
        data: &[u8],
        _ctx: &DeserializationContext<'_>,
    ) -> Result<DeserializeOutcome, SerializationError> {
        Ok(DeserializeOutcome::value(RowValue::Bytes(
            Bytes::copy_from_slice(data),
        )))
    }
}

/// Opaque bytes pass-through
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer for BytesSerializer {
    fn serialize(
        &self,
        value: &RowValue,
        _ctx: &SerializationContext<'_>,
    ) -> Result<Bytes, SerializationError> {
        match value {
            RowValue::Bytes(bytes) => Ok(bytes.clone()),
            RowValue::Null => Ok(Bytes::new()),
            RowValue::Json(_) => Err(SerializationError::UnsupportedPayload {
                codec: "bytes",
                reason: "structured value on a bytes topic".to_string(),
            }),
        }
    }
}

/// Strict UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDeserializer;

impl Deserializer for StringDeserializer {
    fn deserialize(
        &self,
        data: &[u8],
        _ctx: &DeserializationContext<'_>,
    ) -> Result<DeserializeOutcome, SerializationError> {
        let s = std::str::from_utf8(data)?;
        Ok(DeserializeOutcome::value(RowValue::Json(
            serde_json::Value::String(s.to_string()),
        )))
    }
}

/// Strict UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer for StringSerializer {
    fn serialize(
        &self,
        value: &RowValue,
        _ctx: &SerializationContext<'_>,
    ) -> Result<Bytes, SerializationError> {
        match value {
            RowValue::Json(serde_json::Value::String(s)) => Ok(Bytes::from(s.clone())),
            RowValue::Bytes(bytes) => {
                std::str::from_utf8(bytes)?;
                Ok(bytes.clone())
            }
            other => Err(SerializationError::UnsupportedPayload {
                codec: "string",
                reason: format!("expected a string value, got {:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn de_ctx<'a>() -> DeserializationContext<'a> {
        DeserializationContext {
            topic: "t",
            partition: 0,
            headers: &[],
            key: None,
        }
    }

    fn ser_ctx<'a>() -> SerializationContext<'a> {
        SerializationContext {
            topic: "t",
            partition: None,
            headers: &[],
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let outcome = BytesDeserializer.deserialize(b"abc", &de_ctx()).unwrap();
        let DeserializeOutcome::Values(values) = outcome else {
            panic!("expected values");
        };
        let bytes = BytesSerializer.serialize(&values[0], &ser_ctx()).unwrap();
        assert_eq!(bytes, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_bytes_serializer_rejects_json() {
        let err = BytesSerializer
            .serialize(&RowValue::Json(serde_json::json!(1)), &ser_ctx())
            .unwrap_err();
        assert!(matches!(err, SerializationError::UnsupportedPayload { .. }));
    }

    #[test]
    fn test_string_deserializer_rejects_invalid_utf8() {
        let err = StringDeserializer
            .deserialize(&[0xff, 0xfe], &de_ctx())
            .unwrap_err();
        assert!(matches!(err, SerializationError::Utf8(_)));
    }

    #[test]
    fn test_string_serializer() {
        let bytes = StringSerializer
            .serialize(&RowValue::Json(serde_json::json!("hello")), &ser_ctx())
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_broker_timestamp_extractor() {
        let ts = BrokerTimestampExtractor.extract(&RowValue::Null, 42);
        assert_eq!(ts, 42);
    }
}
