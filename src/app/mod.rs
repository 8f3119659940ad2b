//! Application runtime
//!
//! The single-threaded processing loop: poll input, route records to the
//! pipeline bound to their topic, translate state effects into store
//! transactions, produce downstream through the shared row producer, and
//! hand everything to the checkpoint coordinator when a trigger fires.
//! Rebalance callbacks open store partitions and replay changelogs before
//! a partition delivers records; revocation takes a final checkpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::{
    BrokerAdmin, BrokerConsumer, BrokerProducer, ConsumerFactory, InMemoryBroker, RebalanceEvent,
};
use crate::checkpoint::{Checkpoint, CheckpointCoordinator, CommitOutcome};
use crate::config::{AppConfig, AutoOffsetReset, DeserializeErrorPolicy};
use crate::consumer::RowConsumer;
use crate::error::{FatalError, ProcessingPhase, Result, StreamflowError};
use crate::model::{ConsumedRecord, Row, TopicPartition};
use crate::producer::RowProducer;
use crate::state::{RecoveryManager, StateStoreManager, StoreTransaction};
use crate::topics::{Topic, TopicManager};

mod pipeline;

pub use pipeline::{Pipeline, ProcessingContext, StateHandle};

/// Verdict from a record-level pipeline error handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Abort the checkpoint and stop the loop (default)
    Halt,
    /// Skip the record and keep processing
    Skip,
}

/// Record-level error handler installed by the operator
pub type PipelineErrorHandler = Box<dyn FnMut(&StreamflowError, &Row) -> ErrorAction + Send>;

/// Broker connections wired through application setup.
///
/// An explicit context value instead of process-wide registries: everything
/// the runtime talks to arrives through here.
pub struct RuntimeContext {
    pub admin: Arc<dyn BrokerAdmin>,
    pub producer_client: Arc<dyn BrokerProducer>,
    pub consumer_client: Box<dyn BrokerConsumer>,
    pub recovery_consumers: ConsumerFactory,
}

impl RuntimeContext {
    /// Wire everything to an in-process broker.
    pub fn in_memory(broker: &InMemoryBroker, config: &AppConfig) -> Self {
        let recovery_broker = broker.clone();
        let recovery_group = format!("{}-recovery", config.consumer_group);
        Self {
            admin: Arc::new(broker.clone()),
            producer_client: Arc::new(broker.producer()),
            consumer_client: Box::new(
                broker.consumer(&config.consumer_group, config.auto_offset_reset),
            ),
            recovery_consumers: Box::new(move || {
                Box::new(recovery_broker.consumer(&recovery_group, AutoOffsetReset::Earliest))
            }),
        }
    }
}

/// Loop-visible counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeStats {
    pub processed_records: u64,
    pub skipped_records: u64,
    pub deserialize_failures_skipped: u64,
    pub pipeline_failures_skipped: u64,
    pub checkpoints_committed: u64,
    pub checkpoints_skipped: u64,
    pub checkpoints_aborted: u64,
    pub recoveries_completed: u64,
    pub rebalances: u64,
}

/// Cooperative stop signal for a running application
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Per assigned input partition state owned by the loop
struct PartitionState {
    /// Next offset to process; also the floor for the monotonicity guard
    next_offset: i64,
    /// Max-seen record timestamp
    watermark: i64,
    /// Paused for recovery or back-pressure; records buffer meanwhile
    paused: bool,
    buffer: VecDeque<ConsumedRecord>,
    /// Open store transactions keyed by store name
    transactions: HashMap<String, StoreTransaction>,
}

impl PartitionState {
    fn new(next_offset: i64) -> Self {
        Self {
            next_offset,
            watermark: -1,
            paused: false,
            buffer: VecDeque::new(),
            transactions: HashMap::new(),
        }
    }
}

/// A streamflow application: topics, pipelines, stores, and the loop
pub struct Application {
    config: AppConfig,
    topic_manager: TopicManager,
    state_manager: StateStoreManager,
    recovery_manager: RecoveryManager,
    coordinator: CheckpointCoordinator,
    admin: Arc<dyn BrokerAdmin>,
    producer_client: Arc<dyn BrokerProducer>,
    producer: Option<Arc<RowProducer>>,
    consumer: RowConsumer,
    pipelines: HashMap<String, Box<dyn Pipeline>>,
    store_registrations: Vec<(String, String)>,
    partitions: HashMap<TopicPartition, PartitionState>,
    checkpoint: Checkpoint,
    running: Arc<AtomicBool>,
    started: bool,
    error_handler: Option<PipelineErrorHandler>,
    stats: RuntimeStats,
}

impl Application {
    pub fn new(config: AppConfig, ctx: RuntimeContext) -> Self {
        let coordinator = CheckpointCoordinator::from_config(&config);
        let topic_manager = TopicManager::new(
            config.consumer_group.clone(),
            config.replication_factor,
            config.repartition_retention_ms,
        );
        let state_manager = StateStoreManager::new(
            config.group_state_dir(),
            None,
            config.use_changelog_topics,
        );
        Self {
            topic_manager,
            state_manager,
            recovery_manager: RecoveryManager::new(ctx.recovery_consumers),
            coordinator,
            admin: ctx.admin,
            producer_client: ctx.producer_client,
            producer: None,
            consumer: RowConsumer::new(ctx.consumer_client),
            pipelines: HashMap::new(),
            store_registrations: Vec::new(),
            partitions: HashMap::new(),
            checkpoint: Checkpoint::new(),
            running: Arc::new(AtomicBool::new(true)),
            started: false,
            error_handler: None,
            stats: RuntimeStats::default(),
            config,
        }
    }

    /// Register a topic with the manager and return the canonical handle.
    pub fn add_topic(&mut self, topic: Topic) -> Topic {
        self.topic_manager.register(topic)
    }

    /// Bind a pipeline to an input topic. One pipeline per topic; the
    /// latest registration wins.
    pub fn add_pipeline(&mut self, topic: &Topic, pipeline: impl Pipeline + 'static) {
        self.topic_manager.register(topic.clone());
        self.pipelines
            .insert(topic.name().to_string(), Box::new(pipeline));
    }

    /// Declare a named state store for an input topic. Its changelog topic
    /// is derived and created at startup when changelogs are enabled.
    pub fn add_store(&mut self, topic: &Topic, store_name: &str) {
        self.topic_manager.register(topic.clone());
        let registration = (topic.name().to_string(), store_name.to_string());
        if !self.store_registrations.contains(&registration) {
            self.store_registrations.push(registration);
        }
    }

    /// Derive (and register) the repartition topic for a group-by.
    pub fn repartition_topic(&mut self, source: &Topic, operation: &str) -> Result<Topic> {
        self.topic_manager.register(source.clone());
        self.topic_manager.repartition_topic(source.name(), operation)
    }

    /// Install a record-level pipeline error handler.
    pub fn set_error_handler(&mut self, handler: PipelineErrorHandler) {
        self.error_handler = Some(handler);
    }

    /// Handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Max-seen record timestamp for an assigned partition.
    pub fn watermark(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).map(|ps| ps.watermark)
    }

    /// The shared row producer, once started.
    pub fn producer(&self) -> Option<&Arc<RowProducer>> {
        self.producer.as_ref()
    }

    /// The state registry (store partitions are readable between commits).
    pub fn state_manager(&self) -> &StateStoreManager {
        &self.state_manager
    }

    /// Create topics, derive changelogs, validate, build the producer, and
    /// subscribe. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        info!(group = %self.config.consumer_group, "starting application");

        // Inputs first so their partition counts are known, then derived
        // topics, then one validation pass over everything.
        self.topic_manager.ensure_topics_exist(self.admin.as_ref())?;
        for (topic, store) in self.store_registrations.clone() {
            let changelog = if self.config.use_changelog_topics {
                let derived = self.topic_manager.changelog_topic(&topic, &store)?;
                Some(derived.name().to_string())
            } else {
                None
            };
            self.state_manager.register_store(&topic, &store, changelog);
        }
        self.topic_manager.ensure_topics_exist(self.admin.as_ref())?;
        self.topic_manager.validate_all()?;

        let input_names: Vec<String> = self.pipelines.keys().cloned().collect();
        let producer = if self.config.exactly_once() {
            RowProducer::transactional(
                Arc::clone(&self.producer_client),
                self.config.producer_queue_limit,
                &self.config.transactional_id(&input_names),
                self.config.flush_timeout(),
            )?
        } else {
            RowProducer::new(
                Arc::clone(&self.producer_client),
                self.config.producer_queue_limit,
            )
        };
        let producer = Arc::new(producer);
        self.state_manager.set_producer(Arc::clone(&producer));
        self.producer = Some(producer);

        let topics: Vec<Topic> = input_names
            .iter()
            .filter_map(|name| self.topic_manager.topic(name).cloned())
            .collect();
        self.consumer.subscribe(&topics)?;

        self.running.store(true, Ordering::SeqCst);
        self.started = true;
        Ok(())
    }

    /// Run until the shutdown handle fires or a fatal error occurs, then
    /// drain, take a final checkpoint, and close all resources.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        while self.running.load(Ordering::SeqCst) {
            if let Err(fatal) = self.process_once() {
                error!(phase = %fatal.phase, error = %fatal, "processing loop failed");
                self.consumer.close();
                self.state_manager.close();
                return Err(fatal.into());
            }
        }
        self.close().map_err(Into::into)
    }

    /// One loop iteration. Returns whether a record made progress.
    pub fn process_once(&mut self) -> std::result::Result<bool, FatalError> {
        self.handle_rebalance_events()?;

        if let Some(producer) = &self.producer {
            if producer.queue_full() {
                // Bounded memory beats commit cadence: drain in-flight now.
                self.commit_checkpoint(true)?;
                return Ok(false);
            }
        }

        if let Some(record) = self.next_buffered() {
            self.process_record(record)?;
            self.maybe_commit()?;
            return Ok(true);
        }

        let polled = self
            .consumer
            .poll(self.config.poll_timeout())
            .map_err(|e| FatalError::new(ProcessingPhase::Poll, e))?;

        match polled {
            Some(record) => {
                let tp = record.topic_partition();
                let paused = self
                    .partitions
                    .get(&tp)
                    .map(|ps| ps.paused)
                    .unwrap_or(false);
                if paused {
                    if let Some(ps) = self.partitions.get_mut(&tp) {
                        ps.buffer.push_back(record);
                    }
                    return Ok(true);
                }
                self.process_record(record)?;
                self.maybe_commit()?;
                Ok(true)
            }
            None => {
                self.maybe_commit()?;
                Ok(false)
            }
        }
    }

    /// Explicitly request a checkpoint. With `force` the triggers are
    /// bypassed; committing with nothing tracked is still a no-op.
    pub fn commit_checkpoint(
        &mut self,
        force: bool,
    ) -> std::result::Result<CommitOutcome, FatalError> {
        if !force && !self.coordinator.should_commit(&self.checkpoint) {
            return Ok(CommitOutcome::Skipped);
        }
        let Some(producer) = self.producer.clone() else {
            return Ok(CommitOutcome::Skipped);
        };

        let offsets = self.checkpoint.offsets().clone();
        let mut transactions = self.drain_transactions(None);
        let result =
            self.coordinator
                .commit(&offsets, &mut transactions, &producer, &mut self.consumer);
        self.checkpoint = Checkpoint::new();
        match result {
            Ok(CommitOutcome::Committed) => {
                self.stats.checkpoints_committed += 1;
                Ok(CommitOutcome::Committed)
            }
            Ok(CommitOutcome::Skipped) => {
                self.stats.checkpoints_skipped += 1;
                Ok(CommitOutcome::Skipped)
            }
            Err(fatal) => {
                self.stats.checkpoints_aborted += 1;
                Err(fatal)
            }
        }
    }

    /// Drain buffered records, take a final checkpoint, and close the
    /// producer, consumer, and stores.
    pub fn close(&mut self) -> std::result::Result<(), FatalError> {
        if !self.started {
            return Ok(());
        }
        info!("shutting down");
        self.running.store(false, Ordering::SeqCst);

        while let Some(record) = self.next_buffered() {
            self.process_record(record)?;
        }
        self.commit_checkpoint(true)?;

        if let Some(producer) = &self.producer {
            if let Err(err) = producer.flush(self.config.flush_timeout()) {
                warn!(error = %err, "final producer flush failed");
            }
        }
        self.consumer.close();
        self.state_manager.close();
        self.started = false;
        Ok(())
    }

    fn maybe_commit(&mut self) -> std::result::Result<(), FatalError> {
        if self.coordinator.should_commit(&self.checkpoint) {
            self.commit_checkpoint(true)?;
        }
        Ok(())
    }

    fn next_buffered(&mut self) -> Option<ConsumedRecord> {
        self.partitions
            .values_mut()
            .find(|ps| !ps.paused && !ps.buffer.is_empty())
            .and_then(|ps| ps.buffer.pop_front())
    }

    fn advance_offset(&mut self, tp: &TopicPartition, next: i64) {
        if let Some(ps) = self.partitions.get_mut(tp) {
            if next > ps.next_offset {
                ps.next_offset = next;
            }
        }
        self.checkpoint.track_offset(tp.clone(), next);
    }

    fn process_record(&mut self, record: ConsumedRecord) -> std::result::Result<(), FatalError> {
        let tp = record.topic_partition();

        let floor = self
            .partitions
            .entry(tp.clone())
            .or_insert_with(|| PartitionState::new(0))
            .next_offset;
        if record.offset < floor {
            // Already processed; keep pipeline invocations offset-monotone.
            return Ok(());
        }

        let Some(topic) = self.consumer.topic(&record.topic).cloned() else {
            return Ok(());
        };

        let rows = match topic.row_deserialize(&record) {
            Ok(rows) => rows,
            Err(err) => {
                if self.config.on_deserialize_error == DeserializeErrorPolicy::SkipAndCount {
                    warn!(
                        partition = %tp,
                        offset = record.offset,
                        error = %err,
                        "skipping undeserializable record"
                    );
                    self.stats.deserialize_failures_skipped += 1;
                    self.advance_offset(&tp, record.offset + 1);
                    return Ok(());
                }
                return Err(FatalError::new(ProcessingPhase::Deserialize, err).at(
                    record.topic.clone(),
                    record.partition,
                    record.offset,
                ));
            }
        };

        match rows {
            None => {
                // Deserializer skip signal: the offset advances, the
                // pipeline is not invoked, state is untouched.
                self.stats.skipped_records += 1;
                self.advance_offset(&tp, record.offset + 1);
                return Ok(());
            }
            Some(rows) => {
                for row in rows {
                    self.dispatch_row(&tp, row)?;
                }
            }
        }

        if let Some(ps) = self.partitions.get_mut(&tp) {
            if record.timestamp > ps.watermark {
                ps.watermark = record.timestamp;
            }
        }
        self.advance_offset(&tp, record.offset + 1);
        self.checkpoint.record_processed();
        self.stats.processed_records += 1;
        Ok(())
    }

    fn dispatch_row(
        &mut self,
        tp: &TopicPartition,
        row: Row,
    ) -> std::result::Result<(), FatalError> {
        let offset = row.offset();
        let row_for_handler = if self.error_handler.is_some() {
            Some(row.clone())
        } else {
            None
        };

        let result = {
            let Some(producer) = self.producer.as_ref() else {
                return Ok(());
            };
            let Some(ps) = self.partitions.get_mut(tp) else {
                return Ok(());
            };
            let Some(pipeline) = self.pipelines.get_mut(&tp.topic) else {
                return Err(FatalError::new(
                    ProcessingPhase::Pipeline,
                    StreamflowError::PipelineNotRegistered(tp.topic.clone()),
                )
                .at(tp.topic.clone(), tp.partition, offset));
            };

            let mut ctx = ProcessingContext {
                topic: &tp.topic,
                partition: tp.partition,
                producer,
                state_manager: &self.state_manager,
                transactions: &mut ps.transactions,
            };
            pipeline.process(row, &mut ctx)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if let (Some(handler), Some(row)) =
                    (self.error_handler.as_mut(), row_for_handler.as_ref())
                {
                    if handler(&err, row) == ErrorAction::Skip {
                        warn!(partition = %tp, offset, error = %err, "pipeline error classified as skip");
                        self.stats.pipeline_failures_skipped += 1;
                        return Ok(());
                    }
                }
                let fatal = FatalError::new(ProcessingPhase::Pipeline, err).at(
                    tp.topic.clone(),
                    tp.partition,
                    offset,
                );
                self.abort_checkpoint();
                Err(fatal)
            }
        }
    }

    /// Abort the in-flight checkpoint: roll back the producer transaction,
    /// discard every store transaction, keep offsets uncommitted.
    fn abort_checkpoint(&mut self) {
        let mut transactions = self.drain_transactions(None);
        if let Some(producer) = self.producer.clone() {
            self.coordinator.abort(&producer, &mut transactions);
        } else {
            for (_, txn) in transactions.iter_mut() {
                txn.discard();
            }
        }
        self.checkpoint = Checkpoint::new();
        self.stats.checkpoints_aborted += 1;
    }

    fn drain_transactions(
        &mut self,
        only: Option<&[TopicPartition]>,
    ) -> Vec<(TopicPartition, StoreTransaction)> {
        let mut drained = Vec::new();
        for (tp, ps) in self.partitions.iter_mut() {
            if only.map_or(true, |tps| tps.contains(tp)) {
                for (_, txn) in ps.transactions.drain() {
                    drained.push((tp.clone(), txn));
                }
            }
        }
        drained
    }

    fn handle_rebalance_events(&mut self) -> std::result::Result<(), FatalError> {
        while let Some(event) = self.consumer.poll_rebalance() {
            match event {
                RebalanceEvent::Assigned(tps) => self.on_assigned(tps)?,
                RebalanceEvent::Revoked(tps) => self.on_revoked(tps)?,
                RebalanceEvent::Lost(tps) => self.on_lost(tps),
            }
        }
        Ok(())
    }

    fn on_assigned(&mut self, tps: Vec<TopicPartition>) -> std::result::Result<(), FatalError> {
        self.stats.rebalances += 1;
        for tp in &tps {
            self.consumer.pause(tp);
            let committed = self
                .consumer
                .committed(tp)
                .map_err(|e| FatalError::new(ProcessingPhase::Recovery, e))?;
            let mut ps = PartitionState::new(committed.unwrap_or(0));
            ps.paused = true;
            self.partitions.insert(tp.clone(), ps);

            let tasks = self
                .state_manager
                .on_partition_assign(&tp.topic, tp.partition)
                .map_err(|e| FatalError::new(ProcessingPhase::Recovery, e))?;
            for task in tasks {
                self.recovery_manager.assign_partition(task.changelog, task.store);
            }
        }

        if self.recovery_manager.has_assignments() {
            let recovered = self
                .recovery_manager
                .do_recovery()
                .map_err(|e| FatalError::new(ProcessingPhase::Recovery, e))?;
            self.stats.recoveries_completed += recovered.len() as u64;
        }

        for tp in &tps {
            if let Some(ps) = self.partitions.get_mut(tp) {
                ps.paused = false;
            }
            self.consumer.resume(tp);
        }
        info!(partitions = tps.len(), "partitions assigned and recovered");
        Ok(())
    }

    fn on_revoked(&mut self, tps: Vec<TopicPartition>) -> std::result::Result<(), FatalError> {
        info!(partitions = ?tps, "partitions revoked, taking final checkpoint");
        self.checkpoint_partitions(&tps)?;
        for tp in &tps {
            self.partitions.remove(tp);
            self.state_manager.on_partition_revoke(&tp.topic, tp.partition);
            self.recovery_manager.revoke_partition(tp.partition);
        }
        Ok(())
    }

    fn on_lost(&mut self, tps: Vec<TopicPartition>) {
        warn!(partitions = ?tps, "partitions lost, discarding without checkpoint");
        self.checkpoint.take_partitions(&tps);
        let mut transactions = self.drain_transactions(Some(&tps));
        for (_, txn) in transactions.iter_mut() {
            txn.discard();
        }
        for tp in &tps {
            self.partitions.remove(tp);
            self.state_manager.on_partition_revoke(&tp.topic, tp.partition);
            self.recovery_manager.revoke_partition(tp.partition);
        }
    }

    /// Final checkpoint covering only the given partitions (revocation).
    fn checkpoint_partitions(
        &mut self,
        tps: &[TopicPartition],
    ) -> std::result::Result<(), FatalError> {
        let offsets = self.checkpoint.take_partitions(tps);
        let mut transactions = self.drain_transactions(Some(tps));
        if offsets.is_empty() && transactions.iter().all(|(_, t)| !t.is_dirty()) {
            for (_, txn) in transactions.iter_mut() {
                txn.discard();
            }
            return Ok(());
        }
        let Some(producer) = self.producer.clone() else {
            return Ok(());
        };
        match self
            .coordinator
            .commit(&offsets, &mut transactions, &producer, &mut self.consumer)
        {
            Ok(CommitOutcome::Committed) => {
                self.stats.checkpoints_committed += 1;
                Ok(())
            }
            Ok(CommitOutcome::Skipped) => Ok(()),
            Err(fatal) => {
                self.stats.checkpoints_aborted += 1;
                Err(fatal)
            }
        }
    }
}
