//! JSON codec
//!
//! The default value format for input, repartition, and changelog values.

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::error::SerializationError;
use crate::model::RowValue;

use super::{
    DeserializationContext, DeserializeOutcome, SerializationContext, Serializer,
};

/// JSON deserializer
///
/// `expand_arrays` fans a top-level JSON array out into one row per element.
/// `ignore_malformed` turns parse failures into the skip signal instead of
/// an error, for streams where garbage records are expected.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeserializer {
    expand_arrays: bool,
    ignore_malformed: bool,
}

impl JsonDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand top-level arrays into multiple rows.
    pub fn expand_arrays(mut self) -> Self {
        self.expand_arrays = true;
        self
    }

    /// Skip malformed documents instead of failing the loop.
    pub fn ignore_malformed(mut self) -> Self {
        self.ignore_malformed = true;
        self
    }
}

impl super::Deserializer for JsonDeserializer {
    fn deserialize(
        &self,
        data: &[u8],
        ctx: &DeserializationContext<'_>,
    ) -> Result<DeserializeOutcome, SerializationError> {
        let value: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(err) if self.ignore_malformed => {
                debug!(
                    topic = %ctx.topic,
                    partition = ctx.partition,
                    error = %err,
                    "skipping malformed JSON record"
                );
                return Ok(DeserializeOutcome::Skip);
            }
            Err(err) => return Err(err.into()),
        };

        match value {
            Value::Array(items) if self.expand_arrays => Ok(DeserializeOutcome::Values(
                items.into_iter().map(RowValue::Json).collect(),
            )),
            other => Ok(DeserializeOutcome::value(RowValue::Json(other))),
        }
    }
}

/// JSON serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        value: &RowValue,
        _ctx: &SerializationContext<'_>,
    ) -> Result<Bytes, SerializationError> {
        match value {
            RowValue::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            RowValue::Null => Ok(Bytes::from_static(b"null")),
            RowValue::Bytes(_) => Err(SerializationError::UnsupportedPayload {
                codec: "json",
                reason: "opaque bytes on a JSON topic".to_string(),
            }),
        }
    }
}
