//! Checkpointing
//!
//! A [`Checkpoint`] gathers the per-partition next-offsets and the open
//! store transactions accumulated since the previous commit. The
//! [`CheckpointCoordinator`] owns the boundary between "processing" and
//! "committed": changelog writes flush to the broker, then input offsets
//! commit (inside the Kafka transaction when exactly-once), and only then
//! do store transactions apply locally. Durability at the broker strictly
//! precedes durability in the local store, so a crash between the two
//! replays the changelog into a net no-op.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::consumer::RowConsumer;
use crate::error::{FatalError, ProcessingPhase, StreamflowError};
use crate::model::TopicPartition;
use crate::producer::RowProducer;
use crate::state::StoreTransaction;

/// The in-progress commit unit
pub struct Checkpoint {
    created_at: Instant,
    offsets: BTreeMap<TopicPartition, i64>,
    processed: u64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            offsets: BTreeMap::new(),
            processed: 0,
        }
    }

    /// Record the next offset to commit for a partition. Offsets only move
    /// forward; a stale update is ignored.
    pub fn track_offset(&mut self, tp: TopicPartition, next_offset: i64) {
        let entry = self.offsets.entry(tp).or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    /// Bump the processed-record counter.
    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn offsets(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.offsets
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Nothing tracked: committing this checkpoint would be a no-op.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Remove tracking for partitions not in `keep` (rebalance hand-off).
    pub fn retain_partitions(&mut self, keep: &[TopicPartition]) {
        self.offsets.retain(|tp, _| keep.contains(tp));
    }

    /// Split out the offsets belonging to `partitions`.
    pub fn take_partitions(
        &mut self,
        partitions: &[TopicPartition],
    ) -> BTreeMap<TopicPartition, i64> {
        let mut taken = BTreeMap::new();
        self.offsets.retain(|tp, offset| {
            if partitions.contains(tp) {
                taken.insert(tp.clone(), *offset);
                false
            } else {
                true
            }
        });
        taken
    }
}

/// Outcome of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Offsets and state were committed
    Committed,
    /// Nothing to commit; no broker call was issued
    Skipped,
}

/// Drives the strictly-ordered commit sequence
pub struct CheckpointCoordinator {
    commit_interval: Duration,
    commit_every: u64,
    flush_timeout: Duration,
    exactly_once: bool,
}

impl CheckpointCoordinator {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            commit_interval: config.commit_interval(),
            commit_every: config.commit_every,
            flush_timeout: config.flush_timeout(),
            exactly_once: config.exactly_once(),
        }
    }

    /// Whether any checkpoint trigger has fired.
    pub fn should_commit(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.processed() >= self.commit_every
            || (checkpoint.age() >= self.commit_interval && !checkpoint.is_empty())
    }

    /// Run the commit sequence for one checkpoint.
    ///
    /// `offsets` maps each input partition to its next offset to commit;
    /// `transactions` are the store transactions sealed by this checkpoint,
    /// keyed by their source input partition. On any error the producer
    /// transaction is aborted and every transaction is discarded.
    pub fn commit(
        &self,
        offsets: &BTreeMap<TopicPartition, i64>,
        transactions: &mut [(TopicPartition, StoreTransaction)],
        producer: &RowProducer,
        consumer: &mut RowConsumer,
    ) -> Result<CommitOutcome, FatalError> {
        let dirty = transactions.iter().any(|(_, txn)| txn.is_dirty());
        if offsets.is_empty() && !dirty {
            for (_, txn) in transactions.iter_mut() {
                txn.discard();
            }
            debug!("no offsets and no dirty state, skipping commit");
            return Ok(CommitOutcome::Skipped);
        }

        // 1-2. Seal every transaction and emit its changelog records.
        for index in 0..transactions.len() {
            let source = transactions[index].0.clone();
            let source_offset = offsets.get(&source).map(|next| next - 1).unwrap_or(-1);
            let result = transactions[index]
                .1
                .prepare_changelog(source.partition, source_offset);
            if let Err(err) = result {
                error!(partition = %source, error = %err, "changelog prepare failed");
                self.abort(producer, transactions);
                return Err(FatalError::new(ProcessingPhase::Produce, err));
            }
        }

        // 3. Everything in flight must reach the broker within the budget.
        if let Err(err) = producer.flush(self.flush_timeout) {
            error!(error = %err, "producer flush failed, aborting checkpoint");
            self.abort(producer, transactions);
            return Err(FatalError::new(ProcessingPhase::Flush, err.into()));
        }

        // 4. Commit input offsets: through the transaction when
        // exactly-once, plain commit otherwise.
        let commit_result = if self.exactly_once {
            let group = consumer.group_metadata();
            producer
                .send_offsets_to_transaction(offsets, &group)
                .and_then(|()| producer.commit_transaction(self.flush_timeout))
                .map_err(StreamflowError::from)
        } else {
            consumer.commit_sync(offsets)
        };
        if let Err(err) = commit_result {
            error!(error = %err, "offset commit failed, aborting checkpoint");
            self.abort(producer, transactions);
            return Err(FatalError::new(ProcessingPhase::Commit, err));
        }

        // 5. Only now is the local store allowed to catch up.
        for (tp, txn) in transactions.iter_mut() {
            if let Err(err) = txn.commit() {
                error!(partition = %tp, error = %err, "store commit failed");
                return Err(FatalError::new(ProcessingPhase::StoreCommit, err));
            }
        }

        info!(
            partitions = offsets.len(),
            transactions = transactions.len(),
            "checkpoint committed"
        );
        Ok(CommitOutcome::Committed)
    }

    /// Best-effort abort: roll back the producer transaction and drop
    /// every buffered store mutation.
    pub fn abort(
        &self,
        producer: &RowProducer,
        transactions: &mut [(TopicPartition, StoreTransaction)],
    ) {
        if let Err(err) = producer.abort_transaction() {
            warn!(error = %err, "producer transaction abort failed");
        }
        for (_, txn) in transactions.iter_mut() {
            txn.discard();
        }
    }
}
