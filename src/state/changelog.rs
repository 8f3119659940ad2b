//! Changelog records
//!
//! Wire shape written to a changelog topic: key = raw store-key bytes,
//! value = new value bytes or null (tombstone). Headers identify the
//! source of the mutation and the sub-store the key belongs to; the
//! `__prefix` byte multiplexes sub-stores inside a single topic.

use std::sync::Arc;

use bytes::Bytes;

use crate::broker::{DeliveryHandle, ProducerRecord};
use crate::error::ProducerError;
use crate::model::{find_header, Header};
use crate::producer::RowProducer;

/// Header naming the input topic a mutation came from
pub const SOURCE_TOPIC_HEADER: &str = "__source_topic";
/// Header carrying the input partition (4-byte big-endian)
pub const SOURCE_PARTITION_HEADER: &str = "__source_partition";
/// Header carrying the input offset (8-byte big-endian)
pub const SOURCE_OFFSET_HEADER: &str = "__source_offset";
/// Header carrying the sub-store prefix (one byte)
pub const PREFIX_HEADER: &str = "__prefix";

/// Read the sub-store prefix off a changelog record's headers.
pub fn decode_prefix(headers: &[Header]) -> u8 {
    find_header(headers, PREFIX_HEADER)
        .and_then(|v| v.first().copied())
        .unwrap_or(crate::state::PREFIX_DEFAULT)
}

/// Read the source offset off a changelog record's headers.
pub fn decode_source_offset(headers: &[Header]) -> Option<i64> {
    let bytes = find_header(headers, SOURCE_OFFSET_HEADER)?;
    let arr: [u8; 8] = bytes.as_ref().try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

/// Read the source partition off a changelog record's headers.
pub fn decode_source_partition(headers: &[Header]) -> Option<i32> {
    let bytes = find_header(headers, SOURCE_PARTITION_HEADER)?;
    let arr: [u8; 4] = bytes.as_ref().try_into().ok()?;
    Some(i32::from_be_bytes(arr))
}

/// Writer bound to one changelog partition
///
/// Store partitions hold a writer, never the other way around; the shared
/// [`RowProducer`] is the only producer in the process.
pub struct ChangelogWriter {
    producer: Arc<RowProducer>,
    topic: String,
    partition: i32,
    source_topic: String,
}

impl ChangelogWriter {
    pub fn new(
        producer: Arc<RowProducer>,
        topic: impl Into<String>,
        partition: i32,
        source_topic: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            partition,
            source_topic: source_topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Emit one changelog record for a mutated key.
    pub fn write(
        &self,
        prefix: u8,
        key: &[u8],
        value: Option<Bytes>,
        source_partition: i32,
        source_offset: i64,
    ) -> std::result::Result<DeliveryHandle, ProducerError> {
        let headers = vec![
            Header::new(SOURCE_TOPIC_HEADER, Bytes::from(self.source_topic.clone())),
            Header::new(
                SOURCE_PARTITION_HEADER,
                Bytes::copy_from_slice(&source_partition.to_be_bytes()),
            ),
            Header::new(
                SOURCE_OFFSET_HEADER,
                Bytes::copy_from_slice(&source_offset.to_be_bytes()),
            ),
            Header::new(PREFIX_HEADER, Bytes::copy_from_slice(&[prefix])),
        ];

        self.producer.produce_raw(ProducerRecord {
            topic: self.topic.clone(),
            partition: Some(self.partition),
            key: Some(Bytes::copy_from_slice(key)),
            value,
            headers,
            timestamp: None,
        })
    }
}
