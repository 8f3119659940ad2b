//! Row consumer
//!
//! Wraps a broker consumer with the topic registry needed to deserialize
//! messages into rows, and surfaces rebalance notifications to the
//! processing loop. Offsets are never auto-committed; the checkpoint
//! coordinator owns all commits.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::{BrokerConsumer, GroupMetadata, RebalanceEvent};
use crate::error::{Result, StreamflowError};
use crate::model::{ConsumedRecord, Row, TopicPartition};
use crate::topics::Topic;

/// Consumer that knows how to turn messages into rows
pub struct RowConsumer {
    client: Box<dyn BrokerConsumer>,
    topics: HashMap<String, Topic>,
    closed: bool,
}

impl RowConsumer {
    pub fn new(client: Box<dyn BrokerConsumer>) -> Self {
        Self {
            client,
            topics: HashMap::new(),
            closed: false,
        }
    }

    /// Subscribe to the given topics; replaces any prior subscription and
    /// refreshes the internal topic map used for deserialization.
    pub fn subscribe(&mut self, topics: &[Topic]) -> Result<()> {
        let names: Vec<String> = topics.iter().map(|t| t.name().to_string()).collect();
        self.topics = topics
            .iter()
            .map(|t| (t.name().to_string(), t.clone()))
            .collect();
        info!(topics = ?names, "subscribing");
        self.client.subscribe(&names)
    }

    /// The registered topic for a name, if subscribed.
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    /// Fetch one raw record.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>> {
        if self.closed {
            return Err(StreamflowError::ShuttingDown);
        }
        self.client.poll(timeout)
    }

    /// Fetch one record and deserialize it against its topic.
    ///
    /// `Ok(None)` covers three cases: an empty poll, a skip signal from the
    /// deserializer, and a record from an unsubscribed topic.
    pub fn poll_row(&mut self, timeout: Duration) -> Result<Option<Vec<Row>>> {
        let Some(record) = self.poll(timeout)? else {
            return Ok(None);
        };
        let Some(topic) = self.topics.get(&record.topic) else {
            return Ok(None);
        };
        topic.row_deserialize(&record)
    }

    /// Drain the next pending rebalance notification.
    pub fn poll_rebalance(&mut self) -> Option<RebalanceEvent> {
        self.client.poll_rebalance()
    }

    pub fn pause(&mut self, tp: &TopicPartition) {
        debug!(partition = %tp, "pausing partition");
        self.client.pause(tp);
    }

    pub fn resume(&mut self, tp: &TopicPartition) {
        debug!(partition = %tp, "resuming partition");
        self.client.resume(tp);
    }

    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.client.seek(tp, offset)
    }

    pub fn position(&self, tp: &TopicPartition) -> Result<i64> {
        self.client.position(tp)
    }

    pub fn committed(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        self.client.committed(tp)
    }

    pub fn high_watermark(&self, tp: &TopicPartition) -> Result<i64> {
        self.client.high_watermark(tp)
    }

    /// Synchronously commit next-offsets for the group.
    pub fn commit_sync(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        debug!(count = offsets.len(), "committing offsets");
        self.client.commit_sync(offsets)
    }

    pub fn group_metadata(&self) -> GroupMetadata {
        self.client.group_metadata()
    }

    /// Leave the group. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.client.close();
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAdmin, BrokerProducer, InMemoryBroker, ProducerRecord};
    use crate::config::AutoOffsetReset;
    use crate::topics::TopicConfig;
    use bytes::Bytes;

    fn broker_with_records(values: &[&str]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", &TopicConfig::new(1, 1)).unwrap();
        let producer = broker.producer();
        for value in values {
            producer
                .produce(ProducerRecord {
                    topic: "events".to_string(),
                    partition: Some(0),
                    key: None,
                    value: Some(Bytes::from(value.to_string())),
                    headers: Vec::new(),
                    timestamp: Some(0),
                })
                .unwrap();
        }
        broker
    }

    fn consumer(broker: &InMemoryBroker) -> RowConsumer {
        RowConsumer::new(Box::new(broker.consumer("g", AutoOffsetReset::Earliest)))
    }

    #[test]
    fn test_poll_row_deserializes() {
        let broker = broker_with_records(&[r#"{"n": 1}"#]);
        let mut consumer = consumer(&broker);
        consumer.subscribe(&[Topic::json("events")]).unwrap();
        while consumer.poll_rebalance().is_some() {}

        let rows = consumer
            .poll_row(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].offset(), 0);
        assert_eq!(rows[0].value.as_json().unwrap()["n"], 1);
    }

    #[test]
    fn test_poll_row_propagates_deserialize_error() {
        let broker = broker_with_records(&["{oops"]);
        let mut consumer = consumer(&broker);
        consumer.subscribe(&[Topic::json("events")]).unwrap();
        while consumer.poll_rebalance().is_some() {}

        let err = consumer.poll_row(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, StreamflowError::Serialization(_)));
    }

    #[test]
    fn test_poll_after_close_fails() {
        let broker = broker_with_records(&[]);
        let mut consumer = consumer(&broker);
        consumer.close();
        assert!(consumer.poll(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_empty_commit_issues_no_call() {
        let broker = broker_with_records(&[]);
        let mut consumer = consumer(&broker);
        consumer.commit_sync(&BTreeMap::new()).unwrap();
        assert_eq!(
            broker.committed_offset("g", &TopicPartition::new("events", 0)),
            None
        );
    }
}
