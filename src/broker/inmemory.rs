//! In-process broker
//!
//! A complete single-process implementation of the broker traits: topics
//! with partitioned logs, consumer groups with eager rebalancing, group
//! offsets, and transactional produce with read-committed visibility.
//! Transactional records are appended and acknowledged immediately but
//! stay hidden from consumers until the commit marker flips them visible;
//! aborted records keep their offsets and are skipped on fetch. Backs the
//! test suites and embedded runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::AutoOffsetReset;
use crate::error::{ProducerError, Result, StreamflowError};
use crate::model::{ConsumedRecord, Header, TopicPartition};
use crate::topics::TopicConfig;

use super::{
    partition_for_key, BrokerAdmin, BrokerConsumer, BrokerProducer, DeliveryHandle,
    GroupMetadata, ProducerRecord, RebalanceEvent, RecordMetadata,
};

/// Transactional visibility of one log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    /// Committed (or produced outside a transaction)
    Visible,
    /// Part of an open transaction; read-committed consumers stop here
    Pending,
    /// Part of an aborted transaction; consumes an offset, never returned
    Aborted,
}

struct LogRecord {
    timestamp: i64,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
    status: RecordStatus,
}

struct BrokerTopic {
    config: TopicConfig,
    partitions: Vec<Arc<Mutex<Vec<LogRecord>>>>,
}

#[derive(Default)]
struct MemberState {
    subscription: Vec<String>,
    assignment: Vec<TopicPartition>,
    events: VecDeque<RebalanceEvent>,
}

#[derive(Default)]
struct GroupInner {
    generation: i32,
    offsets: HashMap<TopicPartition, i64>,
    members: BTreeMap<String, MemberState>,
}

#[derive(Default)]
struct BrokerInner {
    topics: DashMap<String, BrokerTopic>,
    groups: Mutex<HashMap<String, GroupInner>>,
    txn_epochs: Mutex<HashMap<String, u64>>,
}

impl BrokerInner {
    fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|t| t.partitions.len() as i32)
    }

    fn log(&self, topic: &str, partition: i32) -> Option<Arc<Mutex<Vec<LogRecord>>>> {
        self.topics
            .get(topic)
            .and_then(|t| t.partitions.get(partition as usize).cloned())
    }

    fn append(
        &self,
        record: &ProducerRecord,
        status: RecordStatus,
    ) -> std::result::Result<RecordMetadata, ProducerError> {
        let partitions = self
            .partition_count(&record.topic)
            .ok_or_else(|| ProducerError::DeliveryFailed(format!("unknown topic {}", record.topic)))?;

        let partition = match record.partition {
            Some(p) if p >= 0 && p < partitions => p,
            Some(p) => {
                return Err(ProducerError::DeliveryFailed(format!(
                    "partition {} out of range for {}",
                    p, record.topic
                )))
            }
            None => partition_for_key(record.key.as_deref(), partitions),
        };

        let log = self
            .log(&record.topic, partition)
            .ok_or_else(|| ProducerError::DeliveryFailed("partition vanished".to_string()))?;
        let mut log = log.lock();
        let offset = log.len() as i64;
        log.push(LogRecord {
            timestamp: record
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            key: record.key.clone(),
            value: record.value.clone(),
            headers: record.headers.clone(),
            status,
        });

        Ok(RecordMetadata {
            topic: record.topic.clone(),
            partition,
            offset,
        })
    }

    /// Flip the transactional status of previously appended records.
    fn resolve_records(&self, locations: &[(String, i32, i64)], status: RecordStatus) {
        for (topic, partition, offset) in locations {
            if let Some(log) = self.log(topic, *partition) {
                if let Some(record) = log.lock().get_mut(*offset as usize) {
                    record.status = status;
                }
            }
        }
    }

    /// Eager rebalance: revoke everything, then range-assign the union of
    /// subscribed partitions over the sorted member ids.
    fn rebalance(&self, group: &mut GroupInner) {
        for member in group.members.values_mut() {
            if !member.assignment.is_empty() {
                let revoked = std::mem::take(&mut member.assignment);
                member.events.push_back(RebalanceEvent::Revoked(revoked));
            }
        }

        let subscribed: BTreeSet<String> = group
            .members
            .values()
            .flat_map(|m| m.subscription.iter().cloned())
            .collect();

        let mut all_partitions: Vec<TopicPartition> = Vec::new();
        for topic in &subscribed {
            if let Some(count) = self.partition_count(topic) {
                for partition in 0..count {
                    all_partitions.push(TopicPartition::new(topic.clone(), partition));
                }
            }
        }
        all_partitions.sort();

        let member_ids: Vec<String> = group.members.keys().cloned().collect();
        if member_ids.is_empty() {
            return;
        }

        for (index, tp) in all_partitions.into_iter().enumerate() {
            let member_id = &member_ids[index % member_ids.len()];
            if let Some(member) = group.members.get_mut(member_id) {
                if member.subscription.contains(&tp.topic) {
                    member.assignment.push(tp);
                }
            }
        }

        group.generation += 1;
        for member in group.members.values_mut() {
            member.assignment.sort();
            member
                .events
                .push_back(RebalanceEvent::Assigned(member.assignment.clone()));
        }
        debug!(generation = group.generation, members = group.members.len(), "group rebalanced");
    }
}

/// Shared in-process broker handle
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A producer attached to this broker.
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: Arc::clone(&self.inner),
            txn: Mutex::new(TxnState::default()),
        }
    }

    /// A consumer attached to this broker.
    pub fn consumer(&self, group: &str, auto_offset_reset: AutoOffsetReset) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: Arc::clone(&self.inner),
            group: group.to_string(),
            member_id: format!("member-{}", Uuid::new_v4()),
            auto_offset_reset,
            assignment: Vec::new(),
            manual: false,
            joined: false,
            positions: HashMap::new(),
            paused: HashSet::new(),
            rr: 0,
        }
    }

    /// Committed records in a partition, read-committed view (test
    /// inspection). Aborted and still-pending records are omitted.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<ConsumedRecord> {
        let Some(log) = self.inner.log(topic, partition) else {
            return Vec::new();
        };
        let log = log.lock();
        log.iter()
            .enumerate()
            .filter(|(_, r)| r.status == RecordStatus::Visible)
            .map(|(offset, r)| ConsumedRecord {
                topic: topic.to_string(),
                partition,
                offset: offset as i64,
                timestamp: r.timestamp,
                key: r.key.clone(),
                value: r.value.clone(),
                headers: r.headers.clone(),
            })
            .collect()
    }

    /// Next offset to be written for a partition.
    pub fn high_watermark(&self, topic: &str, partition: i32) -> i64 {
        self.inner
            .log(topic, partition)
            .map(|log| log.lock().len() as i64)
            .unwrap_or(0)
    }

    /// The group's committed next-offset for a partition.
    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.inner
            .groups
            .lock()
            .get(group)
            .and_then(|g| g.offsets.get(tp).copied())
    }
}

impl BrokerAdmin for InMemoryBroker {
    fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()> {
        if self.inner.topics.contains_key(name) {
            return Ok(());
        }
        let partitions = (0..config.num_partitions.max(1))
            .map(|_| Arc::new(Mutex::new(Vec::new())))
            .collect();
        self.inner.topics.insert(
            name.to_string(),
            BrokerTopic {
                config: config.clone(),
                partitions,
            },
        );
        debug!(topic = %name, partitions = config.num_partitions, "created topic");
        Ok(())
    }

    fn describe_topic(&self, name: &str) -> Result<Option<TopicConfig>> {
        Ok(self.inner.topics.get(name).map(|t| t.config.clone()))
    }
}

#[derive(Default)]
struct TxnState {
    transactional_id: Option<String>,
    epoch: u64,
    active: bool,
    /// (topic, partition, offset) of records appended by the open txn
    locations: Vec<(String, i32, i64)>,
    offsets: Vec<(GroupMetadata, BTreeMap<TopicPartition, i64>)>,
}

/// Producer half of the in-process broker
pub struct InMemoryProducer {
    broker: Arc<BrokerInner>,
    txn: Mutex<TxnState>,
}

impl InMemoryProducer {
    fn check_fence(&self, txn: &TxnState) -> std::result::Result<(), ProducerError> {
        let Some(id) = &txn.transactional_id else {
            return Err(ProducerError::NotTransactional);
        };
        let epochs = self.broker.txn_epochs.lock();
        match epochs.get(id) {
            Some(current) if *current == txn.epoch => Ok(()),
            _ => Err(ProducerError::Fenced),
        }
    }
}

impl BrokerProducer for InMemoryProducer {
    fn produce(&self, record: ProducerRecord) -> std::result::Result<DeliveryHandle, ProducerError> {
        let handle = DeliveryHandle::new();
        let mut txn = self.txn.lock();

        // Transactional records land in the log immediately (and are
        // acknowledged), but stay invisible to read-committed consumers
        // until the commit marker.
        let status = if txn.transactional_id.is_some() {
            if !txn.active {
                return Err(ProducerError::NoActiveTransaction);
            }
            RecordStatus::Pending
        } else {
            RecordStatus::Visible
        };

        match self.broker.append(&record, status) {
            Ok(metadata) => {
                if status == RecordStatus::Pending {
                    txn.locations.push((
                        metadata.topic.clone(),
                        metadata.partition,
                        metadata.offset,
                    ));
                }
                handle.resolve(Ok(metadata));
            }
            Err(err) => handle.resolve(Err(err.to_string())),
        }
        Ok(handle)
    }

    fn flush(&self, _timeout: Duration) -> std::result::Result<(), ProducerError> {
        // Deliveries resolve inline; nothing to drive.
        Ok(())
    }

    fn init_transactions(
        &self,
        transactional_id: &str,
        _timeout: Duration,
    ) -> std::result::Result<(), ProducerError> {
        let mut epochs = self.broker.txn_epochs.lock();
        let epoch = epochs
            .entry(transactional_id.to_string())
            .and_modify(|e| *e += 1)
            .or_insert(1);
        let mut txn = self.txn.lock();
        txn.transactional_id = Some(transactional_id.to_string());
        txn.epoch = *epoch;
        debug!(transactional_id = %transactional_id, epoch = *epoch, "initialized transactions");
        Ok(())
    }

    fn begin_transaction(&self) -> std::result::Result<(), ProducerError> {
        let mut txn = self.txn.lock();
        self.check_fence(&txn)?;
        if txn.active {
            return Err(ProducerError::TransactionActive);
        }
        txn.active = true;
        Ok(())
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &BTreeMap<TopicPartition, i64>,
        group: &GroupMetadata,
    ) -> std::result::Result<(), ProducerError> {
        let mut txn = self.txn.lock();
        self.check_fence(&txn)?;
        if !txn.active {
            return Err(ProducerError::NoActiveTransaction);
        }
        txn.offsets.push((group.clone(), offsets.clone()));
        Ok(())
    }

    fn commit_transaction(&self, _timeout: Duration) -> std::result::Result<(), ProducerError> {
        let mut txn = self.txn.lock();
        self.check_fence(&txn)?;
        if !txn.active {
            return Err(ProducerError::NoActiveTransaction);
        }

        let locations = std::mem::take(&mut txn.locations);
        self.broker.resolve_records(&locations, RecordStatus::Visible);

        let mut groups = self.broker.groups.lock();
        for (group_meta, offsets) in txn.offsets.drain(..) {
            let group = groups.entry(group_meta.group_id.clone()).or_default();
            for (tp, offset) in offsets {
                group.offsets.insert(tp, offset);
            }
        }
        drop(groups);

        txn.active = false;
        Ok(())
    }

    fn abort_transaction(&self) -> std::result::Result<(), ProducerError> {
        let mut txn = self.txn.lock();
        let locations = std::mem::take(&mut txn.locations);
        self.broker.resolve_records(&locations, RecordStatus::Aborted);
        txn.offsets.clear();
        txn.active = false;
        Ok(())
    }
}

/// Consumer half of the in-process broker
pub struct InMemoryConsumer {
    broker: Arc<BrokerInner>,
    group: String,
    member_id: String,
    auto_offset_reset: AutoOffsetReset,
    assignment: Vec<TopicPartition>,
    manual: bool,
    joined: bool,
    positions: HashMap<TopicPartition, i64>,
    paused: HashSet<TopicPartition>,
    rr: usize,
}

impl InMemoryConsumer {
    fn initial_position(&self, tp: &TopicPartition) -> i64 {
        if self.manual {
            return 0;
        }
        if let Some(committed) = self
            .broker
            .groups
            .lock()
            .get(&self.group)
            .and_then(|g| g.offsets.get(tp).copied())
        {
            return committed;
        }
        match self.auto_offset_reset {
            AutoOffsetReset::Earliest => 0,
            AutoOffsetReset::Latest => self
                .broker
                .log(&tp.topic, tp.partition)
                .map(|log| log.lock().len() as i64)
                .unwrap_or(0),
        }
    }

    fn has_pending_events(&self) -> bool {
        self.broker
            .groups
            .lock()
            .get(&self.group)
            .and_then(|g| g.members.get(&self.member_id))
            .map(|m| !m.events.is_empty())
            .unwrap_or(false)
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let mut groups = self.broker.groups.lock();
        let group = groups.entry(self.group.clone()).or_default();
        let member = group.members.entry(self.member_id.clone()).or_default();
        member.subscription = topics.to_vec();
        self.broker.rebalance(group);
        self.joined = true;
        self.manual = false;
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.manual = true;
        self.assignment = partitions.to_vec();
        self.positions.clear();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>> {
        if !self.manual && self.has_pending_events() {
            // Force the caller to drain rebalance notifications first.
            return Ok(None);
        }

        if self.assignment.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(None);
        }

        for step in 0..self.assignment.len() {
            let tp = self.assignment[(self.rr + step) % self.assignment.len()].clone();
            if self.paused.contains(&tp) {
                continue;
            }
            let position = match self.positions.get(&tp) {
                Some(p) => *p,
                None => {
                    let p = self.initial_position(&tp);
                    self.positions.insert(tp.clone(), p);
                    p
                }
            };

            let Some(log) = self.broker.log(&tp.topic, tp.partition) else {
                continue;
            };
            let log = log.lock();
            let mut cursor = position;
            let consumed = loop {
                match log.get(cursor as usize) {
                    // Aborted records consume an offset but are never
                    // returned under read-committed.
                    Some(record) if record.status == RecordStatus::Aborted => {
                        cursor += 1;
                    }
                    // An open transaction blocks the partition here.
                    Some(record) if record.status == RecordStatus::Pending => break None,
                    Some(record) => {
                        break Some(ConsumedRecord {
                            topic: tp.topic.clone(),
                            partition: tp.partition,
                            offset: cursor,
                            timestamp: record.timestamp,
                            key: record.key.clone(),
                            value: record.value.clone(),
                            headers: record.headers.clone(),
                        })
                    }
                    None => break None,
                }
            };
            drop(log);

            match consumed {
                Some(record) => {
                    self.positions.insert(tp.clone(), record.offset + 1);
                    self.rr = (self.rr + step + 1) % self.assignment.len();
                    return Ok(Some(record));
                }
                None if cursor != position => {
                    // Skipped an aborted tail; remember the progress.
                    self.positions.insert(tp.clone(), cursor);
                }
                None => {}
            }
        }

        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(None)
    }

    fn poll_rebalance(&mut self) -> Option<RebalanceEvent> {
        if self.manual {
            return None;
        }
        let mut groups = self.broker.groups.lock();
        let event = groups
            .get_mut(&self.group)
            .and_then(|g| g.members.get_mut(&self.member_id))
            .and_then(|m| m.events.pop_front())?;
        drop(groups);

        match &event {
            RebalanceEvent::Assigned(tps) => {
                self.assignment = tps.clone();
                self.rr = 0;
            }
            RebalanceEvent::Revoked(tps) | RebalanceEvent::Lost(tps) => {
                self.assignment.retain(|tp| !tps.contains(tp));
                for tp in tps {
                    self.positions.remove(tp);
                    self.paused.remove(tp);
                }
                self.rr = 0;
            }
        }
        Some(event)
    }

    fn pause(&mut self, tp: &TopicPartition) {
        self.paused.insert(tp.clone());
    }

    fn resume(&mut self, tp: &TopicPartition) {
        self.paused.remove(tp);
    }

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.positions.insert(tp.clone(), offset);
        Ok(())
    }

    fn position(&self, tp: &TopicPartition) -> Result<i64> {
        Ok(self
            .positions
            .get(tp)
            .copied()
            .unwrap_or_else(|| self.initial_position(tp)))
    }

    fn committed(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        Ok(self
            .broker
            .groups
            .lock()
            .get(&self.group)
            .and_then(|g| g.offsets.get(tp).copied()))
    }

    fn high_watermark(&self, tp: &TopicPartition) -> Result<i64> {
        self.broker
            .log(&tp.topic, tp.partition)
            .map(|log| log.lock().len() as i64)
            .ok_or_else(|| StreamflowError::Broker(format!("unknown partition {}", tp)))
    }

    fn commit_sync(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        let mut groups = self.broker.groups.lock();
        let group = groups.entry(self.group.clone()).or_default();
        for (tp, offset) in offsets {
            group.offsets.insert(tp.clone(), *offset);
        }
        Ok(())
    }

    fn group_metadata(&self) -> GroupMetadata {
        let generation = self
            .broker
            .groups
            .lock()
            .get(&self.group)
            .map(|g| g.generation)
            .unwrap_or(0);
        GroupMetadata {
            group_id: self.group.clone(),
            generation,
            member_id: self.member_id.clone(),
        }
    }

    fn close(&mut self) {
        if self.joined {
            let mut groups = self.broker.groups.lock();
            if let Some(group) = groups.get_mut(&self.group) {
                group.members.remove(&self.member_id);
                self.broker.rebalance(group);
            }
            self.joined = false;
        }
        self.assignment.clear();
        self.positions.clear();
        self.paused.clear();
    }
}
