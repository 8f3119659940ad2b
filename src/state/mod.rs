//! State subsystem
//!
//! Per (store name, partition) embedded key-value partitions with an open
//! transaction API, changelog replication on the producer side, and
//! changelog recovery on the consumer side. The
//! [`StateStoreManager`] owns the registry and reacts to rebalance
//! callbacks; the processing loop owns the transactions in between.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::model::TopicPartition;
use crate::producer::RowProducer;

pub mod changelog;
mod partition;
pub mod recovery;
mod transaction;

pub use changelog::{
    ChangelogWriter, PREFIX_HEADER, SOURCE_OFFSET_HEADER, SOURCE_PARTITION_HEADER,
    SOURCE_TOPIC_HEADER,
};
pub use partition::{composite_key, StorePartition, PREFIX_DEFAULT};
pub use recovery::{RecoveryManager, RecoveryTask};
pub use transaction::{StoreTransaction, TransactionStatus};

/// Name of the store used when an application does not pick one
pub const DEFAULT_STORE_NAME: &str = "default";

/// A named store: one partition per assigned input partition
pub struct Store {
    name: String,
    topic: String,
    changelog_topic: Option<String>,
    base_dir: Option<PathBuf>,
    partitions: HashMap<i32, Arc<Mutex<StorePartition>>>,
}

impl Store {
    fn new(
        name: String,
        topic: String,
        changelog_topic: Option<String>,
        base_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name,
            topic,
            changelog_topic,
            base_dir,
            partitions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn changelog_topic(&self) -> Option<&str> {
        self.changelog_topic.as_deref()
    }

    /// The assigned store partition, if any.
    pub fn partition(&self, partition: i32) -> Option<Arc<Mutex<StorePartition>>> {
        self.partitions.get(&partition).cloned()
    }

    fn assign_partition(
        &mut self,
        partition: i32,
    ) -> std::result::Result<Arc<Mutex<StorePartition>>, StoreError> {
        if let Some(existing) = self.partitions.get(&partition) {
            return Ok(Arc::clone(existing));
        }
        let opened = StorePartition::open(&self.name, partition, self.base_dir.as_deref())?;
        let shared = Arc::new(Mutex::new(opened));
        self.partitions.insert(partition, Arc::clone(&shared));
        Ok(shared)
    }

    fn revoke_partition(&mut self, partition: i32) {
        if let Some(store) = self.partitions.remove(&partition) {
            if let Err(err) = store.lock().close() {
                warn!(
                    store = %self.name,
                    partition,
                    error = %err,
                    "failed to close store partition on revoke"
                );
            }
        }
    }

    /// Begin a transaction against an assigned partition.
    fn start_transaction(
        &self,
        partition: i32,
        producer: Option<&Arc<RowProducer>>,
    ) -> Result<StoreTransaction> {
        let store = self
            .partition(partition)
            .ok_or_else(|| StoreError::PartitionNotAssigned {
                store: self.name.clone(),
                partition,
            })?;

        let changelog = match (&self.changelog_topic, producer) {
            (Some(topic), Some(producer)) => Some(ChangelogWriter::new(
                Arc::clone(producer),
                topic.clone(),
                partition,
                self.topic.clone(),
            )),
            _ => None,
        };

        Ok(StoreTransaction::new(
            self.name.clone(),
            partition,
            store,
            changelog,
        )?)
    }
}

/// Registry of stores plus the rebalance bookkeeping around them
pub struct StateStoreManager {
    /// Group-scoped base directory; `None` keeps all state in memory
    state_dir: Option<PathBuf>,
    /// topic -> store name -> store
    stores: HashMap<String, HashMap<String, Store>>,
    producer: Option<Arc<RowProducer>>,
    use_changelogs: bool,
}

impl StateStoreManager {
    pub fn new(
        state_dir: Option<PathBuf>,
        producer: Option<Arc<RowProducer>>,
        use_changelogs: bool,
    ) -> Self {
        Self {
            state_dir,
            stores: HashMap::new(),
            producer,
            use_changelogs,
        }
    }

    /// Whether state changes replicate to changelog topics.
    pub fn using_changelogs(&self) -> bool {
        self.use_changelogs && self.producer.is_some()
    }

    /// Wire in the shared row producer once it exists (it is built after
    /// topic setup because the transactional id depends on the inputs).
    pub fn set_producer(&mut self, producer: Arc<RowProducer>) {
        self.producer = Some(producer);
    }

    /// Register a store for a topic. Registering the same (topic, store)
    /// twice keeps the first registration.
    pub fn register_store(
        &mut self,
        topic: &str,
        store_name: &str,
        changelog_topic: Option<String>,
    ) {
        let base_dir = self
            .state_dir
            .as_ref()
            .map(|dir| dir.join(store_name));
        let changelog = if self.use_changelogs { changelog_topic } else { None };

        self.stores
            .entry(topic.to_string())
            .or_default()
            .entry(store_name.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, store = %store_name, changelog = ?changelog, "registered store");
                Store::new(
                    store_name.to_string(),
                    topic.to_string(),
                    changelog,
                    base_dir,
                )
            });
    }

    /// The registered store for (topic, name).
    pub fn store(&self, topic: &str, store_name: &str) -> Result<&Store> {
        self.stores
            .get(topic)
            .and_then(|stores| stores.get(store_name))
            .ok_or_else(|| {
                StoreError::StoreNotRegistered {
                    store: store_name.to_string(),
                    topic: topic.to_string(),
                }
                .into()
            })
    }

    /// Store names registered for a topic.
    pub fn store_names(&self, topic: &str) -> Vec<String> {
        self.stores
            .get(topic)
            .map(|stores| stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any store is registered for the topic.
    pub fn has_stores(&self, topic: &str) -> bool {
        self.stores.get(topic).is_some_and(|s| !s.is_empty())
    }

    /// Begin a transaction for (topic, store, partition).
    pub fn start_transaction(
        &self,
        topic: &str,
        store_name: &str,
        partition: i32,
    ) -> Result<StoreTransaction> {
        self.store(topic, store_name)?
            .start_transaction(partition, self.producer.as_ref())
    }

    /// Open store partitions for an assigned input partition and return
    /// the changelog replays that must run before it processes records.
    pub fn on_partition_assign(
        &mut self,
        topic: &str,
        partition: i32,
    ) -> Result<Vec<RecoveryTask>> {
        let mut tasks = Vec::new();
        let Some(stores) = self.stores.get_mut(topic) else {
            return Ok(tasks);
        };

        for store in stores.values_mut() {
            let assigned = store.assign_partition(partition)?;
            if let Some(changelog) = &store.changelog_topic {
                tasks.push(RecoveryTask {
                    changelog: TopicPartition::new(changelog.clone(), partition),
                    store: assigned,
                });
            }
        }
        info!(topic = %topic, partition, stores = stores.len(), "assigned store partitions");
        Ok(tasks)
    }

    /// Close and drop store partitions for a revoked input partition.
    pub fn on_partition_revoke(&mut self, topic: &str, partition: i32) {
        if let Some(stores) = self.stores.get_mut(topic) {
            for store in stores.values_mut() {
                store.revoke_partition(partition);
            }
            info!(topic = %topic, partition, "revoked store partitions");
        }
    }

    /// Close every assigned store partition.
    pub fn close(&mut self) {
        for stores in self.stores.values_mut() {
            for store in stores.values_mut() {
                let partitions: Vec<i32> = store.partitions.keys().copied().collect();
                for partition in partitions {
                    store.revoke_partition(partition);
                }
            }
        }
    }
}
