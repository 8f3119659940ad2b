#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # streamflow
//!
//! streamflow is a client-side stream-processing library that turns a
//! Kafka cluster into a stateful dataflow engine. An application declares
//! a pipeline of transforms over one or more input topics; the runtime
//! consumes records, executes the pipeline, maintains keyed state in a
//! local embedded store, replicates that state to compacted changelog
//! topics, and commits input offsets together with state and produced
//! output atomically from the application's point of view.
//!
//! ## Quick Start
//!
//! ```no_run
//! use streamflow::{
//!     AppConfig, Application, AutoOffsetReset, InMemoryBroker, Result,
//!     RuntimeContext, Topic, TopicConfig,
//! };
//!
//! fn main() -> Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let config = AppConfig::new("word-counter")
//!         .with_auto_offset_reset(AutoOffsetReset::Earliest);
//!
//!     let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
//!     let words = Topic::json("words").with_create_config(TopicConfig::new(1, 1));
//!     app.add_store(&words, "default");
//!     app.add_pipeline(
//!         &words,
//!         |row: streamflow::Row, ctx: &mut streamflow::ProcessingContext<'_>| -> Result<()> {
//!             if let Some(text) = row.value.as_str() {
//!                 for word in text.split_whitespace() {
//!                     let mut state = ctx.state()?;
//!                     let count: u64 = state.get(word.as_bytes())?.unwrap_or(0);
//!                     state.set(word.as_bytes(), &(count + 1))?;
//!                 }
//!             }
//!             Ok(())
//!         },
//!     );
//!
//!     app.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`topics`]: topic configs, logical topics, and the manager that
//!   derives changelog/repartition topics
//! - [`serializers`]: value codecs and the skip-vs-fail deserialization
//!   contract
//! - [`broker`]: the consumer/producer/admin traits plus a complete
//!   in-process broker
//! - [`producer`]: the shared row producer with delivery tracking and
//!   transactions
//! - [`consumer`]: the row consumer and rebalance notifications
//! - [`state`]: store partitions, store transactions, changelog
//!   replication and recovery
//! - [`checkpoint`]: the strictly-ordered commit sequence
//! - [`app`]: pipelines and the single-threaded processing loop
//! - [`error`]: error types and the `Result` alias
//!
//! ## Delivery guarantees
//!
//! With `ProcessingGuarantee::AtLeastOnce` offsets commit through the
//! consumer after produced output is flushed. With
//! `ProcessingGuarantee::ExactlyOnce` offsets are enlisted into the
//! producer's Kafka transaction, so output, state changelogs, and input
//! progress become visible atomically. In both modes the local store only
//! applies a transaction after the broker side is durable; recovery
//! replays the changelog tail to close any gap.

pub mod app;
pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod model;
pub mod producer;
pub mod serializers;
pub mod state;
pub mod topics;

pub use app::{
    Application, ErrorAction, Pipeline, PipelineErrorHandler, ProcessingContext, RuntimeContext,
    RuntimeStats, ShutdownHandle, StateHandle,
};
pub use broker::{
    BrokerAdmin, BrokerConsumer, BrokerProducer, ConsumerFactory, DeliveryHandle, GroupMetadata,
    InMemoryBroker, ProducerRecord, RebalanceEvent, RecordMetadata,
};
pub use checkpoint::{Checkpoint, CheckpointCoordinator, CommitOutcome};
pub use config::{
    AppConfig, AutoOffsetReset, DeserializeErrorPolicy, ProcessingGuarantee,
};
pub use consumer::RowConsumer;
pub use error::{
    FatalError, ProcessingPhase, ProducerError, RecoveryError, Result, SerializationError,
    StoreError, StreamflowError, TopicError,
};
pub use model::{ConsumedRecord, Header, MessageContext, Row, RowValue, TopicPartition};
pub use producer::RowProducer;
pub use serializers::{
    BytesDeserializer, BytesSerializer, Deserializer, DeserializeOutcome, JsonDeserializer,
    JsonSerializer, Serializer, StringDeserializer, StringSerializer, TimestampExtractor,
};
pub use state::{
    StateStoreManager, StorePartition, StoreTransaction, TransactionStatus, DEFAULT_STORE_NAME,
    PREFIX_DEFAULT,
};
pub use topics::{Topic, TopicConfig, TopicManager};
