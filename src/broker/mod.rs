//! Broker adapters
//!
//! Kafka is an external collaborator: the runtime reaches it through the
//! narrow traits in this module. [`InMemoryBroker`] is a complete
//! in-process implementation used by tests and embedded runs; a network
//! transport implements the same traits outside this crate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{ProducerError, Result};
use crate::model::{ConsumedRecord, Header, TopicPartition};
use crate::topics::TopicConfig;

mod inmemory;

pub use inmemory::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};

/// A record handed to a broker producer
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    /// Destination topic
    pub topic: String,
    /// Explicit destination partition; `None` lets the partitioner choose
    pub partition: Option<i32>,
    /// Optional message key
    pub key: Option<Bytes>,
    /// Message value; `None` produces a tombstone
    pub value: Option<Bytes>,
    /// Ordered headers
    pub headers: Vec<Header>,
    /// Explicit timestamp (ms); `None` stamps at append time
    pub timestamp: Option<i64>,
}

/// Where a produced record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Per-message delivery tracking
///
/// Every produce returns a handle; the broker adapter resolves it once the
/// record is acknowledged (or definitively failed). Waiting is bounded so
/// flush deadlines hold.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    slot: Arc<DeliverySlot>,
}

#[derive(Debug)]
struct DeliverySlot {
    result: Mutex<Option<std::result::Result<RecordMetadata, String>>>,
    cond: Condvar,
}

impl Default for DeliveryHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryHandle {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(DeliverySlot {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Record the delivery outcome and wake all waiters.
    pub fn resolve(&self, result: std::result::Result<RecordMetadata, String>) {
        let mut guard = self.slot.result.lock();
        if guard.is_none() {
            *guard = Some(result);
            self.slot.cond.notify_all();
        }
    }

    /// The outcome, if already resolved.
    pub fn try_result(&self) -> Option<std::result::Result<RecordMetadata, String>> {
        self.slot.result.lock().clone()
    }

    /// Block until resolved or the deadline passes.
    pub fn wait_until(
        &self,
        deadline: Instant,
    ) -> Option<std::result::Result<RecordMetadata, String>> {
        let mut guard = self.slot.result.lock();
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .slot
                .cond
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        guard.clone()
    }
}

/// Consumer-group identity enlisted into producer transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    pub group_id: String,
    pub generation: i32,
    pub member_id: String,
}

/// Rebalance notification delivered through the consumer adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions newly assigned to this consumer
    Assigned(Vec<TopicPartition>),
    /// Partitions being taken away; a final commit is still possible
    Revoked(Vec<TopicPartition>),
    /// Partitions already owned elsewhere; commits would fail
    Lost(Vec<TopicPartition>),
}

/// Administrative operations against the broker
pub trait BrokerAdmin: Send + Sync {
    /// Create a topic. Creating one that already exists is a success.
    fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()>;

    /// Inspect a topic's live config; `None` when it does not exist.
    fn describe_topic(&self, name: &str) -> Result<Option<TopicConfig>>;
}

/// Producer side of the broker connection
pub trait BrokerProducer: Send + Sync {
    /// Enqueue a record for asynchronous delivery.
    fn produce(&self, record: ProducerRecord) -> std::result::Result<DeliveryHandle, ProducerError>;

    /// Drive outstanding deliveries for at most `timeout`.
    fn flush(&self, timeout: Duration) -> std::result::Result<(), ProducerError>;

    /// Register the transactional id and obtain the fencing epoch.
    fn init_transactions(
        &self,
        transactional_id: &str,
        timeout: Duration,
    ) -> std::result::Result<(), ProducerError>;

    fn begin_transaction(&self) -> std::result::Result<(), ProducerError>;

    fn send_offsets_to_transaction(
        &self,
        offsets: &BTreeMap<TopicPartition, i64>,
        group: &GroupMetadata,
    ) -> std::result::Result<(), ProducerError>;

    fn commit_transaction(&self, timeout: Duration) -> std::result::Result<(), ProducerError>;

    fn abort_transaction(&self) -> std::result::Result<(), ProducerError>;
}

/// Consumer side of the broker connection
pub trait BrokerConsumer: Send {
    /// Join the group subscribed to `topics`; replaces any prior subscription.
    fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Manually assign partitions without joining a group (recovery readers).
    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Fetch one record. `None` on timeout or while a rebalance is pending.
    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>>;

    /// Drain the next pending rebalance notification, if any.
    fn poll_rebalance(&mut self) -> Option<RebalanceEvent>;

    fn pause(&mut self, tp: &TopicPartition);

    fn resume(&mut self, tp: &TopicPartition);

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Next offset this consumer will fetch for `tp`.
    fn position(&self, tp: &TopicPartition) -> Result<i64>;

    /// Last committed offset for the group, if any.
    fn committed(&self, tp: &TopicPartition) -> Result<Option<i64>>;

    /// Next offset to be written to `tp`.
    fn high_watermark(&self, tp: &TopicPartition) -> Result<i64>;

    /// Synchronously commit the given next-offsets for the group.
    fn commit_sync(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()>;

    fn group_metadata(&self) -> GroupMetadata;

    /// Leave the group and release the assignment.
    fn close(&mut self);
}

/// Factory for short-lived recovery consumers
pub type ConsumerFactory = Box<dyn Fn() -> Box<dyn BrokerConsumer> + Send>;

/// Key-hash partitioner used when a record has a key but no partition.
///
/// FNV-1a over the key bytes; keyless records go to partition 0, matching
/// the sticky-partitioner behavior of routing them by the producer batch.
pub fn partition_for_key(key: Option<&[u8]>, num_partitions: i32) -> i32 {
    let Some(key) = key else {
        return 0;
    };
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % num_partitions.max(1) as u64) as i32
}
