//! Store partitions
//!
//! One [`StorePartition`] per (store name, input partition): a sorted
//! key-value dataset with prefix scans, batched atomic writes, and a small
//! metadata file recording the changelog watermark (`processed_offset`)
//! and the writer `epoch` used for fencing concurrent writers.
//!
//! Keys are composite: one sub-store prefix byte followed by the user key.
//! Dataset entries carry crc32 checksums verified on load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;

/// Prefix byte of the default sub-store
pub const PREFIX_DEFAULT: u8 = 0x00;

/// Dataset file name inside a store-partition directory
const DATASET_FILE: &str = "dataset.json";
/// Metadata file name inside a store-partition directory
const METADATA_FILE: &str = "metadata.json";

/// Build the composite key for a sub-store entry.
pub fn composite_key(prefix: u8, key: &[u8]) -> Vec<u8> {
    let mut composite = Vec::with_capacity(1 + key.len());
    composite.push(prefix);
    composite.extend_from_slice(key);
    composite
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    crc: u32,
}

impl DatasetEntry {
    fn checksum(key: &[u8], value: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(value);
        hasher.finalize()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    processed_offset: i64,
    epoch: u64,
}

/// An embedded sorted key-value store bound to one input partition
#[derive(Debug)]
pub struct StorePartition {
    store_name: String,
    partition: i32,
    path: Option<PathBuf>,
    data: BTreeMap<Vec<u8>, Bytes>,
    processed_offset: i64,
    epoch: u64,
    txn_open: bool,
}

impl StorePartition {
    /// Open (or create) the partition under `base_dir/{partition}`.
    ///
    /// `None` keeps the partition purely in memory. Opening bumps the
    /// writer epoch and persists it immediately so a stale writer that
    /// comes back later can be told apart by its old epoch.
    pub fn open(
        store_name: &str,
        partition: i32,
        base_dir: Option<&Path>,
    ) -> std::result::Result<Self, StoreError> {
        let path = base_dir.map(|dir| dir.join(partition.to_string()));

        let mut this = Self {
            store_name: store_name.to_string(),
            partition,
            path,
            data: BTreeMap::new(),
            processed_offset: -1,
            epoch: 0,
            txn_open: false,
        };

        if let Some(dir) = this.path.clone() {
            fs::create_dir_all(&dir)?;
            this.load(&dir)?;
            this.epoch += 1;
            this.persist_metadata(&dir)?;
            info!(
                store = %this.store_name,
                partition,
                entries = this.data.len(),
                processed_offset = this.processed_offset,
                epoch = this.epoch,
                "opened store partition"
            );
        }

        Ok(this)
    }

    fn load(&mut self, dir: &Path) -> std::result::Result<(), StoreError> {
        let metadata_path = dir.join(METADATA_FILE);
        if metadata_path.exists() {
            let content = fs::read_to_string(&metadata_path)?;
            let metadata: Metadata = serde_json::from_str(&content)
                .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
            self.processed_offset = metadata.processed_offset;
            self.epoch = metadata.epoch;
        }

        let dataset_path = dir.join(DATASET_FILE);
        if dataset_path.exists() {
            let content = fs::read_to_string(&dataset_path)?;
            let entries: Vec<DatasetEntry> = serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupted(e.to_string()))?;
            for entry in entries {
                if DatasetEntry::checksum(&entry.key, &entry.value) != entry.crc {
                    return Err(StoreError::Corrupted(format!(
                        "checksum mismatch for key of {} bytes in {}",
                        entry.key.len(),
                        dataset_path.display()
                    )));
                }
                self.data.insert(entry.key, Bytes::from(entry.value));
            }
        }
        Ok(())
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Changelog offset up to which this partition's state is durable.
    /// `-1` means the partition has never seen a changelog record.
    pub fn processed_offset(&self) -> i64 {
        self.processed_offset
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Point lookup by composite key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    /// All entries of one sub-store, in key order.
    pub fn items_with_prefix(&self, prefix: u8) -> Vec<(Vec<u8>, Bytes)> {
        self.data
            .range(vec![prefix]..)
            .take_while(|(k, _)| k.first() == Some(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Apply a batch of puts/tombstones atomically and optionally advance
    /// the processed-offset watermark. The batch hits disk before this
    /// returns.
    pub fn write_batch(
        &mut self,
        writes: &BTreeMap<Vec<u8>, Option<Bytes>>,
        processed_offset: Option<i64>,
    ) -> std::result::Result<(), StoreError> {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.data.insert(key.clone(), value.clone());
                }
                None => {
                    self.data.remove(key);
                }
            }
        }
        if let Some(offset) = processed_offset {
            self.processed_offset = offset;
        }

        if let Some(dir) = self.path.clone() {
            self.persist_dataset(&dir)?;
            self.persist_metadata(&dir)?;
        }
        debug!(
            store = %self.store_name,
            partition = self.partition,
            writes = writes.len(),
            processed_offset = self.processed_offset,
            "applied write batch"
        );
        Ok(())
    }

    /// Mark a transaction open; at most one at a time.
    pub(crate) fn begin_txn(&mut self) -> std::result::Result<(), StoreError> {
        if self.txn_open {
            return Err(StoreError::TransactionOpen {
                store: self.store_name.clone(),
                partition: self.partition,
            });
        }
        self.txn_open = true;
        Ok(())
    }

    pub(crate) fn release_txn(&mut self) {
        self.txn_open = false;
    }

    /// Persist and release. Safe to call more than once.
    pub fn close(&mut self) -> std::result::Result<(), StoreError> {
        if let Some(dir) = self.path.clone() {
            self.persist_dataset(&dir)?;
            self.persist_metadata(&dir)?;
        }
        debug!(store = %self.store_name, partition = self.partition, "closed store partition");
        Ok(())
    }

    fn persist_dataset(&self, dir: &Path) -> std::result::Result<(), StoreError> {
        let entries: Vec<DatasetEntry> = self
            .data
            .iter()
            .map(|(key, value)| DatasetEntry {
                key: key.clone(),
                value: value.to_vec(),
                crc: DatasetEntry::checksum(key, value),
            })
            .collect();
        let content = serde_json::to_string(&entries)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        write_atomic(&dir.join(DATASET_FILE), content.as_bytes())?;
        Ok(())
    }

    fn persist_metadata(&self, dir: &Path) -> std::result::Result<(), StoreError> {
        let metadata = Metadata {
            processed_offset: self.processed_offset,
            epoch: self.epoch,
        };
        let content = serde_json::to_string(&metadata)
            .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        write_atomic(&dir.join(METADATA_FILE), content.as_bytes())?;
        Ok(())
    }
}

/// Write via a temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(store: &mut StorePartition, prefix: u8, key: &[u8], value: &[u8]) {
        let mut batch = BTreeMap::new();
        batch.insert(
            composite_key(prefix, key),
            Some(Bytes::copy_from_slice(value)),
        );
        store.write_batch(&batch, None).unwrap();
    }

    #[test]
    fn test_in_memory_get_and_delete() {
        let mut store = StorePartition::open("default", 0, None).unwrap();
        put(&mut store, PREFIX_DEFAULT, b"a", b"1");
        assert_eq!(
            store.get(&composite_key(PREFIX_DEFAULT, b"a")),
            Some(Bytes::from_static(b"1"))
        );

        let mut batch = BTreeMap::new();
        batch.insert(composite_key(PREFIX_DEFAULT, b"a"), None);
        store.write_batch(&batch, None).unwrap();
        assert!(store.get(&composite_key(PREFIX_DEFAULT, b"a")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_scan_is_disjoint() {
        let mut store = StorePartition::open("default", 0, None).unwrap();
        put(&mut store, 0x00, b"a", b"1");
        put(&mut store, 0x00, b"b", b"2");
        put(&mut store, 0x01, b"a", b"expiry");

        let values = store.items_with_prefix(0x00);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].0, composite_key(0x00, b"a"));

        let expiry = store.items_with_prefix(0x01);
        assert_eq!(expiry.len(), 1);
        assert!(store.items_with_prefix(0x02).is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        {
            let mut store = StorePartition::open("default", 3, Some(dir.path())).unwrap();
            put(&mut store, PREFIX_DEFAULT, b"a", b"4");
            let mut batch = BTreeMap::new();
            batch.insert(
                composite_key(PREFIX_DEFAULT, b"b"),
                Some(Bytes::from_static(b"3")),
            );
            store.write_batch(&batch, Some(7)).unwrap();
            store.close().unwrap();
        }

        let store = StorePartition::open("default", 3, Some(dir.path())).unwrap();
        assert_eq!(store.processed_offset(), 7);
        assert_eq!(
            store.get(&composite_key(PREFIX_DEFAULT, b"a")),
            Some(Bytes::from_static(b"4"))
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_epoch_bumps_on_every_open() {
        let dir = tempdir().unwrap();
        let first = StorePartition::open("default", 0, Some(dir.path()))
            .unwrap()
            .epoch();
        let second = StorePartition::open("default", 0, Some(dir.path()))
            .unwrap()
            .epoch();
        assert!(second > first);
    }

    #[test]
    fn test_corrupted_dataset_is_rejected() {
        let dir = tempdir().unwrap();
        {
            let mut store = StorePartition::open("default", 0, Some(dir.path())).unwrap();
            put(&mut store, PREFIX_DEFAULT, b"a", b"1");
        }
        let dataset = dir.path().join("0").join(DATASET_FILE);
        let content = fs::read_to_string(&dataset).unwrap();
        fs::write(&dataset, content.replace("\"value\":[49]", "\"value\":[50]")).unwrap();

        let err = StorePartition::open("default", 0, Some(dir.path())).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));
    }

    #[test]
    fn test_single_open_transaction() {
        let mut store = StorePartition::open("default", 0, None).unwrap();
        store.begin_txn().unwrap();
        assert!(matches!(
            store.begin_txn(),
            Err(StoreError::TransactionOpen { .. })
        ));
        store.release_txn();
        store.begin_txn().unwrap();
    }

    #[test]
    fn test_fresh_partition_watermark_is_minus_one() {
        let store = StorePartition::open("default", 0, None).unwrap();
        assert_eq!(store.processed_offset(), -1);
    }
}
