//! Changelog recovery
//!
//! On partition assignment each store partition replays the tail of its
//! changelog, from its persisted `processed_offset` watermark up to the
//! broker high watermark, before the partition is eligible for
//! processing. Each replay uses a dedicated short-lived consumer; a store
//! partition is only ever touched by one recovery pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::broker::ConsumerFactory;
use crate::error::{RecoveryError, Result};
use crate::model::TopicPartition;

use super::changelog::decode_prefix;
use super::partition::{composite_key, StorePartition};

/// Poll timeout while replaying a changelog tail
const RECOVERY_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive empty polls before a replay counts as stalled
const RECOVERY_STALL_POLLS: u32 = 50;

/// One pending replay: a changelog partition and its store partition
pub struct RecoveryTask {
    pub changelog: TopicPartition,
    pub store: Arc<Mutex<StorePartition>>,
}

/// Runs changelog replays queued during partition assignment
pub struct RecoveryManager {
    consumer_factory: ConsumerFactory,
    tasks: Vec<RecoveryTask>,
}

impl RecoveryManager {
    pub fn new(consumer_factory: ConsumerFactory) -> Self {
        Self {
            consumer_factory,
            tasks: Vec::new(),
        }
    }

    /// Queue a replay for an assigned store partition.
    pub fn assign_partition(
        &mut self,
        changelog: TopicPartition,
        store: Arc<Mutex<StorePartition>>,
    ) {
        debug!(changelog = %changelog, "queued changelog recovery");
        self.tasks.push(RecoveryTask { changelog, store });
    }

    /// Drop pending replays for a partition being revoked.
    pub fn revoke_partition(&mut self, partition: i32) {
        self.tasks.retain(|t| t.changelog.partition != partition);
    }

    /// Whether any replay is pending.
    pub fn has_assignments(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Run every queued replay to its high watermark.
    ///
    /// Returns the changelog partitions that were replayed (including
    /// no-op replays). Partitions recovered here are eligible for
    /// processing; on error the whole assignment is considered failed.
    pub fn do_recovery(&mut self) -> Result<Vec<TopicPartition>> {
        let mut recovered = Vec::new();
        for task in std::mem::take(&mut self.tasks) {
            self.recover_one(&task)?;
            recovered.push(task.changelog);
        }
        Ok(recovered)
    }

    fn recover_one(&self, task: &RecoveryTask) -> Result<()> {
        let tp = &task.changelog;
        let processed = task.store.lock().processed_offset();

        let mut consumer = (self.consumer_factory)();
        consumer.assign(std::slice::from_ref(tp))?;
        let high_watermark = consumer.high_watermark(tp)?;

        if processed + 1 >= high_watermark {
            debug!(
                changelog = %tp,
                processed_offset = processed,
                high_watermark,
                "store already caught up, skipping recovery"
            );
            return Ok(());
        }

        info!(
            changelog = %tp,
            from = processed + 1,
            to = high_watermark,
            "replaying changelog tail"
        );
        consumer.seek(tp, processed + 1)?;

        let mut writes: BTreeMap<Vec<u8>, Option<Bytes>> = BTreeMap::new();
        let mut position = processed + 1;
        let mut empty_polls = 0;

        while position < high_watermark {
            let Some(record) = consumer.poll(RECOVERY_POLL_TIMEOUT)? else {
                // The consumer can advance past aborted transactional
                // records without returning anything.
                let consumer_position = consumer.position(tp)?;
                if consumer_position > position {
                    position = consumer_position;
                    empty_polls = 0;
                    continue;
                }
                empty_polls += 1;
                if empty_polls >= RECOVERY_STALL_POLLS {
                    return Err(RecoveryError::Stalled {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        position,
                        high_watermark,
                    }
                    .into());
                }
                continue;
            };
            empty_polls = 0;

            let prefix = decode_prefix(&record.headers);
            let key = record.key.as_deref().unwrap_or_default();
            writes.insert(composite_key(prefix, key), record.value.clone());
            position = record.offset + 1;
        }

        let mut store = task.store.lock();
        store.write_batch(&writes, Some(high_watermark - 1))?;
        info!(
            changelog = %tp,
            keys = writes.len(),
            processed_offset = store.processed_offset(),
            "changelog recovery complete"
        );
        Ok(())
    }
}
