//! Domain-specific error types
//!
//! Each subsystem gets its own error enum; they fold into
//! [`StreamflowError`](super::StreamflowError) via `#[from]`.

use thiserror::Error;

/// Errors raised while (de)serializing record keys and values
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unsupported payload for codec {codec}: {reason}")]
    UnsupportedPayload {
        codec: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Custom(String),
}

/// Errors raised by the topic manager and topic validation
#[derive(Error, Debug)]
pub enum TopicError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("topic {0} has no serializers configured; it is not usable for produce")]
    SerializersNotSet(String),

    #[error("topic {0} has no deserializers configured; it is not usable for consume")]
    DeserializersNotSet(String),

    #[error(
        "changelog {changelog} has {actual} partitions but source topic has {expected}"
    )]
    PartitionCountMismatch {
        changelog: String,
        expected: i32,
        actual: i32,
    },

    #[error("changelog topic {0} is not compacted")]
    NotCompacted(String),

    #[error("broker config for topic {0} was never inspected")]
    BrokerConfigMissing(String),

    #[error("topic creation failed for {topic}: {reason}")]
    CreationFailed { topic: String, reason: String },

    #[error("timed out inspecting topic {0}")]
    InspectionTimeout(String),

    #[error("topic validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Errors raised by the row producer
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer queue is full")]
    QueueFull,

    #[error("flush timed out with {pending} messages still in flight")]
    FlushTimeout { pending: usize },

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("a transaction is already in progress")]
    TransactionActive,

    #[error("no transaction is in progress")]
    NoActiveTransaction,

    #[error("producer is not transactional")]
    NotTransactional,

    #[error("producer fenced by a newer instance with the same transactional id")]
    Fenced,

    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

impl ProducerError {
    /// Abortable transaction errors get one retry before escalating.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProducerError::TransactionFailed(_))
    }
}

/// Errors raised by store partitions and store transactions
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store {store}[{partition}] already has an open transaction")]
    TransactionOpen { store: String, partition: i32 },

    #[error("transaction for {store}[{partition}] is {status}, not open")]
    TransactionNotOpen {
        store: String,
        partition: i32,
        status: &'static str,
    },

    #[error("transaction for {store}[{partition}] was not prepared before commit")]
    TransactionNotPrepared { store: String, partition: i32 },

    #[error("store partition {store}[{partition}] is not assigned")]
    PartitionNotAssigned { store: String, partition: i32 },

    #[error("store {store} is not registered for topic {topic}")]
    StoreNotRegistered { store: String, topic: String },

    #[error("store dataset corrupted: {0}")]
    Corrupted(String),

    #[error("store metadata invalid: {0}")]
    InvalidMetadata(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised during changelog recovery
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("changelog {topic}[{partition}] unreachable: {reason}")]
    ChangelogUnreachable {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error(
        "recovery of {topic}[{partition}] stalled at offset {position} before high watermark {high_watermark}"
    )]
    Stalled {
        topic: String,
        partition: i32,
        position: i64,
        high_watermark: i64,
    },

    #[error("recovery interrupted by shutdown")]
    Interrupted,
}
