//! Core record types
//!
//! Raw broker records ([`ConsumedRecord`]), deserialized pipeline rows
//! ([`Row`]), and the small shared vocabulary around them.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod row;

pub use row::{MessageContext, Row, RowValue};

/// A (topic, partition) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record header (key-value pair)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Header key
    pub key: String,
    /// Header value
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Find the first header with the given key.
pub fn find_header<'a>(headers: &'a [Header], key: &str) -> Option<&'a Bytes> {
    headers.iter().find(|h| h.key == key).map(|h| &h.value)
}

/// A raw record as returned by the broker consumer, before deserialization
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Broker timestamp (milliseconds since epoch)
    pub timestamp: i64,
    /// Optional message key
    pub key: Option<Bytes>,
    /// Message value; `None` is a tombstone
    pub value: Option<Bytes>,
    /// Ordered headers
    pub headers: Vec<Header>,
}

impl ConsumedRecord {
    /// The record's topic partition.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Approximate wire size in bytes.
    pub fn size(&self) -> usize {
        let key_size = self.key.as_ref().map(|k| k.len()).unwrap_or(0);
        let value_size = self.value.as_ref().map(|v| v.len()).unwrap_or(0);
        let headers_size: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.value.len())
            .sum();
        8 + 8 + key_size + value_size + headers_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("words", 2);
        assert_eq!(tp.to_string(), "words[2]");
    }

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("a", 1);
        let b = TopicPartition::new("a", 2);
        let c = TopicPartition::new("b", 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_find_header() {
        let headers = vec![
            Header::new("h1", Bytes::from_static(b"v1")),
            Header::new("h2", Bytes::from_static(b"v2")),
            Header::new("h1", Bytes::from_static(b"shadowed")),
        ];
        assert_eq!(find_header(&headers, "h1"), Some(&Bytes::from_static(b"v1")));
        assert_eq!(find_header(&headers, "h3"), None);
    }

    #[test]
    fn test_consumed_record_size() {
        let record = ConsumedRecord {
            topic: "t".to_string(),
            partition: 0,
            offset: 0,
            timestamp: 0,
            key: Some(Bytes::from_static(b"key")),
            value: Some(Bytes::from_static(b"value")),
            headers: Vec::new(),
        };
        assert_eq!(record.size(), 24);
    }
}
