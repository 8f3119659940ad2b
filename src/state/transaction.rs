//! Store transactions
//!
//! The unit of mutation against a store partition. Reads hit the write-set
//! first, then a read cache, then the partition. Mutations buffer until the
//! checkpoint seals the transaction: `prepare_changelog` emits one record
//! per mutated key, and `commit` applies the write-set atomically once the
//! changelog (and offsets) are durable at the broker. The store never leads
//! the changelog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::DeliveryHandle;
use crate::error::{ProducerError, Result, StoreError};

use super::changelog::ChangelogWriter;
use super::partition::{composite_key, StorePartition};

/// Monotonic transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Prepared,
    Committed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Open => "open",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Debug for StoreTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("store_name", &self.store_name)
            .field("partition", &self.partition)
            .field("status", &self.status)
            .field("released", &self.released)
            .finish()
    }
}

/// A buffered mutation set against one (store, partition)
pub struct StoreTransaction {
    store_name: String,
    partition: i32,
    store: Arc<Mutex<StorePartition>>,
    changelog: Option<ChangelogWriter>,
    writes: BTreeMap<Vec<u8>, Option<Bytes>>,
    read_cache: HashMap<Vec<u8>, Option<Bytes>>,
    delivery: Vec<DeliveryHandle>,
    status: TransactionStatus,
    released: bool,
}

impl StoreTransaction {
    pub(crate) fn new(
        store_name: String,
        partition: i32,
        store: Arc<Mutex<StorePartition>>,
        changelog: Option<ChangelogWriter>,
    ) -> std::result::Result<Self, StoreError> {
        store.lock().begin_txn()?;
        Ok(Self {
            store_name,
            partition,
            store,
            changelog,
            writes: BTreeMap::new(),
            read_cache: HashMap::new(),
            delivery: Vec::new(),
            status: TransactionStatus::Open,
            released: false,
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether any key was mutated.
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    fn require_open(&self) -> std::result::Result<(), StoreError> {
        if self.status != TransactionStatus::Open {
            return Err(StoreError::TransactionNotOpen {
                store: self.store_name.clone(),
                partition: self.partition,
                status: self.status.as_str(),
            });
        }
        Ok(())
    }

    /// Read a key: write-set first, then the cache, then the store.
    pub fn get(&mut self, prefix: u8, key: &[u8]) -> std::result::Result<Option<Bytes>, StoreError> {
        let composite = composite_key(prefix, key);
        if let Some(buffered) = self.writes.get(&composite) {
            return Ok(buffered.clone());
        }
        if let Some(cached) = self.read_cache.get(&composite) {
            return Ok(cached.clone());
        }
        let value = self.store.lock().get(&composite);
        self.read_cache.insert(composite, value.clone());
        Ok(value)
    }

    /// Buffer a put.
    pub fn set(
        &mut self,
        prefix: u8,
        key: &[u8],
        value: Bytes,
    ) -> std::result::Result<(), StoreError> {
        self.require_open()?;
        self.writes.insert(composite_key(prefix, key), Some(value));
        Ok(())
    }

    /// Buffer a tombstone.
    pub fn delete(&mut self, prefix: u8, key: &[u8]) -> std::result::Result<(), StoreError> {
        self.require_open()?;
        self.writes.insert(composite_key(prefix, key), None);
        Ok(())
    }

    /// Emit one changelog record per mutated key, tagged with the source
    /// input partition and offset. Seals the transaction; fails fast on the
    /// first producer error.
    pub fn prepare_changelog(
        &mut self,
        source_partition: i32,
        source_offset: i64,
    ) -> Result<()> {
        self.require_open()?;

        if let Some(changelog) = &self.changelog {
            for (composite, value) in &self.writes {
                let (prefix, key) = composite
                    .split_first()
                    .ok_or_else(|| StoreError::Corrupted("empty composite key".to_string()))?;
                match changelog.write(*prefix, key, value.clone(), source_partition, source_offset)
                {
                    Ok(handle) => self.delivery.push(handle),
                    Err(err) => {
                        self.status = TransactionStatus::Failed;
                        return Err(err.into());
                    }
                }
            }
            debug!(
                store = %self.store_name,
                partition = self.partition,
                records = self.delivery.len(),
                "prepared changelog"
            );
        }

        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// Highest acknowledged changelog offset for this transaction.
    ///
    /// Only meaningful after the producer flushed; an unacknowledged or
    /// failed delivery is an error.
    pub fn changelog_position(&self) -> std::result::Result<Option<i64>, ProducerError> {
        let mut position = None;
        for handle in &self.delivery {
            match handle.try_result() {
                Some(Ok(metadata)) => {
                    position = Some(position.map_or(metadata.offset, |p: i64| p.max(metadata.offset)));
                }
                Some(Err(reason)) => return Err(ProducerError::DeliveryFailed(reason)),
                None => {
                    return Err(ProducerError::DeliveryFailed(
                        "changelog record not acknowledged".to_string(),
                    ))
                }
            }
        }
        Ok(position)
    }

    /// Apply the write-set to the store atomically and advance its
    /// `processed_offset` to the highest delivered changelog offset.
    /// Idempotent after success.
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Prepared => {}
            _ => {
                return Err(StoreError::TransactionNotPrepared {
                    store: self.store_name.clone(),
                    partition: self.partition,
                }
                .into())
            }
        }

        let position = self.changelog_position()?;
        let mut store = self.store.lock();
        store.write_batch(&self.writes, position)?;
        store.release_txn();
        drop(store);

        self.released = true;
        self.status = TransactionStatus::Committed;
        debug!(
            store = %self.store_name,
            partition = self.partition,
            writes = self.writes.len(),
            changelog_position = ?position,
            "committed store transaction"
        );
        Ok(())
    }

    /// Drop the write-set; the store is untouched.
    pub fn discard(&mut self) {
        if self.status == TransactionStatus::Committed {
            return;
        }
        if self.is_dirty() {
            warn!(
                store = %self.store_name,
                partition = self.partition,
                discarded = self.writes.len(),
                "discarding store transaction"
            );
        }
        self.writes.clear();
        self.delivery.clear();
        self.status = TransactionStatus::Failed;
        if !self.released {
            self.store.lock().release_txn();
            self.released = true;
        }
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if !self.released {
            self.store.lock().release_txn();
            self.released = true;
        }
    }
}
