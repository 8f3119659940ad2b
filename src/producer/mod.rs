//! Row producer
//!
//! Wraps a broker producer with per-message delivery tracking, a bounded
//! in-flight queue used for back-pressure, and the transactional surface
//! the checkpoint coordinator drives in exactly-once mode.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::{
    BrokerProducer, DeliveryHandle, GroupMetadata, ProducerRecord, RecordMetadata,
};
use crate::error::{ProducerError, Result};
use crate::model::{Header, RowValue, TopicPartition};
use crate::serializers::SerializationContext;
use crate::topics::Topic;

/// Producer shared by the pipeline outputs and the changelog writers
pub struct RowProducer {
    client: Arc<dyn BrokerProducer>,
    pending: Mutex<Vec<DeliveryHandle>>,
    queue_limit: usize,
    transactional: bool,
    txn_active: Mutex<bool>,
}

impl RowProducer {
    /// A plain (at-least-once) producer.
    pub fn new(client: Arc<dyn BrokerProducer>, queue_limit: usize) -> Self {
        Self {
            client,
            pending: Mutex::new(Vec::new()),
            queue_limit,
            transactional: false,
            txn_active: Mutex::new(false),
        }
    }

    /// A transactional producer; registers the id and fencing epoch.
    pub fn transactional(
        client: Arc<dyn BrokerProducer>,
        queue_limit: usize,
        transactional_id: &str,
        timeout: Duration,
    ) -> std::result::Result<Self, ProducerError> {
        client.init_transactions(transactional_id, timeout)?;
        Ok(Self {
            client,
            pending: Mutex::new(Vec::new()),
            queue_limit,
            transactional: true,
            txn_active: Mutex::new(false),
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        *self.txn_active.lock()
    }

    /// Number of messages awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Back-pressure signal: the in-flight queue hit its bound.
    pub fn queue_full(&self) -> bool {
        self.pending_count() >= self.queue_limit
    }

    /// Serialize and enqueue one message for a topic.
    ///
    /// A `Null` value produces a tombstone without touching the serializer.
    pub fn produce(
        &self,
        topic: &Topic,
        key: Option<Bytes>,
        value: &RowValue,
        headers: Vec<Header>,
        partition: Option<i32>,
        timestamp: Option<i64>,
    ) -> Result<DeliveryHandle> {
        let payload = match value {
            RowValue::Null => None,
            other => {
                let ctx = SerializationContext {
                    topic: topic.name(),
                    partition,
                    headers: &headers,
                };
                Some(topic.value_serializer()?.serialize(other, &ctx)?)
            }
        };

        let handle = self.produce_raw(ProducerRecord {
            topic: topic.name().to_string(),
            partition,
            key,
            value: payload,
            headers,
            timestamp,
        })?;
        Ok(handle)
    }

    /// Enqueue pre-serialized bytes (changelog and repartition writers).
    pub fn produce_raw(
        &self,
        record: ProducerRecord,
    ) -> std::result::Result<DeliveryHandle, ProducerError> {
        if self.queue_full() {
            return Err(ProducerError::QueueFull);
        }
        if self.transactional {
            self.ensure_transaction()?;
        }
        let handle = self.client.produce(record)?;
        self.pending.lock().push(handle.clone());
        Ok(handle)
    }

    /// Block until every in-flight message is acknowledged.
    ///
    /// On timeout all unacknowledged messages are dropped from tracking;
    /// the caller must treat them as lost for the current checkpoint.
    pub fn flush(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Vec<RecordMetadata>, ProducerError> {
        let deadline = Instant::now() + timeout;
        self.client.flush(timeout)?;

        let handles: Vec<DeliveryHandle> = self.pending.lock().drain(..).collect();
        let mut delivered = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            match handle.wait_until(deadline) {
                Some(Ok(metadata)) => delivered.push(metadata),
                Some(Err(reason)) => {
                    warn!(reason = %reason, "message delivery failed during flush");
                    return Err(ProducerError::DeliveryFailed(reason));
                }
                None => {
                    return Err(ProducerError::FlushTimeout {
                        pending: handles.len() - index,
                    })
                }
            }
        }
        debug!(delivered = delivered.len(), "producer flushed");
        Ok(delivered)
    }

    /// Open a transaction; produces before the next commit ride in it.
    pub fn begin_transaction(&self) -> std::result::Result<(), ProducerError> {
        if !self.transactional {
            return Err(ProducerError::NotTransactional);
        }
        let mut active = self.txn_active.lock();
        if *active {
            return Err(ProducerError::TransactionActive);
        }
        self.client.begin_transaction()?;
        *active = true;
        Ok(())
    }

    fn ensure_transaction(&self) -> std::result::Result<(), ProducerError> {
        let mut active = self.txn_active.lock();
        if !*active {
            self.client.begin_transaction()?;
            *active = true;
        }
        Ok(())
    }

    /// Enlist the input consumer's offsets into the open transaction.
    pub fn send_offsets_to_transaction(
        &self,
        offsets: &BTreeMap<TopicPartition, i64>,
        group: &GroupMetadata,
    ) -> std::result::Result<(), ProducerError> {
        if !self.transactional {
            return Err(ProducerError::NotTransactional);
        }
        self.ensure_transaction()?;
        self.client.send_offsets_to_transaction(offsets, group)
    }

    /// Commit the open transaction; abortable errors get one retry.
    pub fn commit_transaction(
        &self,
        timeout: Duration,
    ) -> std::result::Result<(), ProducerError> {
        if !self.transactional {
            return Err(ProducerError::NotTransactional);
        }
        let mut active = self.txn_active.lock();
        if !*active {
            return Err(ProducerError::NoActiveTransaction);
        }

        match self.client.commit_transaction(timeout) {
            Ok(()) => {}
            Err(err) if err.is_retriable() => {
                warn!(error = %err, "transaction commit failed, retrying once");
                self.client.commit_transaction(timeout)?;
            }
            Err(err) => return Err(err),
        }
        *active = false;
        Ok(())
    }

    /// Abort the open transaction, if any.
    pub fn abort_transaction(&self) -> std::result::Result<(), ProducerError> {
        if !self.transactional {
            return Ok(());
        }
        let mut active = self.txn_active.lock();
        if *active {
            self.client.abort_transaction()?;
            *active = false;
        }
        self.pending.lock().clear();
        Ok(())
    }
}
