//! Logical topics
//!
//! A [`Topic`] couples a name with its creation/broker configs and the
//! codecs chosen at registration time. A topic is usable for produce only
//! when its serializers are set, and for consume only when its
//! deserializers are set.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TopicError};
use crate::model::{ConsumedRecord, MessageContext, Row, RowValue};
use crate::serializers::{
    BrokerTimestampExtractor, BytesDeserializer, BytesSerializer, DeserializationContext,
    Deserializer, DeserializeOutcome, Serializer, TimestampExtractor,
};

use super::TopicConfig;

/// A logical topic with its codecs and configs
#[derive(Clone)]
pub struct Topic {
    name: String,
    /// Config used when streamflow creates the topic; absent means the
    /// topic is externally managed
    create_config: Option<TopicConfig>,
    /// Config observed on the broker, filled in after inspection
    broker_config: Option<TopicConfig>,
    value_serializer: Option<Arc<dyn Serializer>>,
    key_serializer: Option<Arc<dyn Serializer>>,
    value_deserializer: Option<Arc<dyn Deserializer>>,
    key_deserializer: Option<Arc<dyn Deserializer>>,
    timestamp_extractor: Arc<dyn TimestampExtractor>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("create_config", &self.create_config)
            .field("broker_config", &self.broker_config)
            .field("producible", &self.value_serializer.is_some())
            .field("consumable", &self.value_deserializer.is_some())
            .finish()
    }
}

impl Topic {
    /// A bare topic with no codecs; not yet usable for produce or consume.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_config: None,
            broker_config: None,
            value_serializer: None,
            key_serializer: None,
            value_deserializer: None,
            key_deserializer: None,
            timestamp_extractor: Arc::new(BrokerTimestampExtractor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_create_config(mut self, config: TopicConfig) -> Self {
        self.create_config = Some(config);
        self
    }

    pub fn with_value_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.value_serializer = Some(serializer);
        self
    }

    pub fn with_key_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.key_serializer = Some(serializer);
        self
    }

    pub fn with_value_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.value_deserializer = Some(deserializer);
        self
    }

    pub fn with_key_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.key_deserializer = Some(deserializer);
        self
    }

    pub fn with_timestamp_extractor(mut self, extractor: Arc<dyn TimestampExtractor>) -> Self {
        self.timestamp_extractor = extractor;
        self
    }

    /// Default wiring for a stream topic: JSON values both ways, raw keys.
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_value_serializer(Arc::new(crate::serializers::JsonSerializer))
            .with_key_serializer(Arc::new(BytesSerializer))
            .with_value_deserializer(Arc::new(crate::serializers::JsonDeserializer::new()))
            .with_key_deserializer(Arc::new(BytesDeserializer))
    }

    pub fn create_config(&self) -> Option<&TopicConfig> {
        self.create_config.as_ref()
    }

    pub fn broker_config(&self) -> Option<&TopicConfig> {
        self.broker_config.as_ref()
    }

    pub(crate) fn set_broker_config(&mut self, config: TopicConfig) {
        self.broker_config = Some(config);
    }

    /// Partition count: broker truth when inspected, else the create config.
    pub fn partition_count(&self) -> Option<i32> {
        self.broker_config
            .as_ref()
            .or(self.create_config.as_ref())
            .map(|c| c.num_partitions)
    }

    /// The value serializer, or the produce-usability error.
    pub fn value_serializer(&self) -> std::result::Result<&dyn Serializer, TopicError> {
        self.value_serializer
            .as_deref()
            .ok_or_else(|| TopicError::SerializersNotSet(self.name.clone()))
    }

    /// The value deserializer, or the consume-usability error.
    pub fn value_deserializer(&self) -> std::result::Result<&dyn Deserializer, TopicError> {
        self.value_deserializer
            .as_deref()
            .ok_or_else(|| TopicError::DeserializersNotSet(self.name.clone()))
    }

    /// Deserialize one consumed record into rows.
    ///
    /// Returns `None` when the deserializer asked to skip the message.
    pub fn row_deserialize(&self, record: &ConsumedRecord) -> Result<Option<Vec<Row>>> {
        let deserializer = self.value_deserializer()?;
        let ctx = DeserializationContext {
            topic: &record.topic,
            partition: record.partition,
            headers: &record.headers,
            key: record.key.as_deref(),
        };

        let outcome = match &record.value {
            Some(data) => deserializer.deserialize(data, &ctx)?,
            None => DeserializeOutcome::value(RowValue::Null),
        };

        let values = match outcome {
            DeserializeOutcome::Skip => return Ok(None),
            DeserializeOutcome::Values(values) => values,
        };

        let context = MessageContext {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            size: record.size(),
        };

        let rows = values
            .into_iter()
            .map(|value| {
                let timestamp = self.timestamp_extractor.extract(&value, record.timestamp);
                Row::new(
                    value,
                    record.key.clone(),
                    timestamp,
                    record.headers.clone(),
                    context.clone(),
                )
            })
            .collect();

        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn record(value: Option<&'static [u8]>) -> ConsumedRecord {
        ConsumedRecord {
            topic: "events".to_string(),
            partition: 1,
            offset: 5,
            timestamp: 1_000,
            key: Some(Bytes::from_static(b"k")),
            value: value.map(Bytes::from_static),
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_bare_topic_unusable() {
        let topic = Topic::new("events");
        assert!(topic.value_serializer().is_err());
        assert!(topic.value_deserializer().is_err());
    }

    #[test]
    fn test_row_deserialize_json() {
        let topic = Topic::json("events");
        let rows = topic
            .row_deserialize(&record(Some(br#"{"a": 1}"#)))
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value.as_json().unwrap(), &json!({"a": 1}));
        assert_eq!(rows[0].offset(), 5);
        assert_eq!(rows[0].timestamp, 1_000);
    }

    #[test]
    fn test_row_deserialize_tombstone() {
        let topic = Topic::json("events");
        let rows = topic.row_deserialize(&record(None)).unwrap().unwrap();
        assert!(rows[0].value.is_null());
    }

    #[test]
    fn test_row_deserialize_skip() {
        let topic = Topic::new("events").with_value_deserializer(Arc::new(
            crate::serializers::JsonDeserializer::new().ignore_malformed(),
        ));
        let result = topic.row_deserialize(&record(Some(b"{oops"))).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_partition_count_prefers_broker_config() {
        let mut topic = Topic::new("events").with_create_config(TopicConfig::new(2, 1));
        assert_eq!(topic.partition_count(), Some(2));
        topic.set_broker_config(TopicConfig::new(6, 3));
        assert_eq!(topic.partition_count(), Some(6));
    }
}
