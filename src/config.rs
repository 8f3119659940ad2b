//! Application configuration
//!
//! [`AppConfig`] carries every knob the processing runtime recognizes. All
//! values are immutable after startup; builder-style setters make the
//! common overrides ergonomic while `Default` keeps a zero-config
//! application runnable against a local broker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default max wall time between checkpoints (ms)
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 5_000;
/// Default max processed records between checkpoints
pub const DEFAULT_COMMIT_EVERY: u64 = 100;
/// Default consumer poll timeout (ms)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
/// Default producer flush budget (ms)
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 10_000;
/// Default bound on in-flight produced messages
pub const DEFAULT_PRODUCER_QUEUE_LIMIT: usize = 10_000;
/// Default retention for repartition topics (7 days, ms)
pub const DEFAULT_REPARTITION_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;
/// Default replication factor for derived topics
pub const DEFAULT_REPLICATION_FACTOR: i16 = 1;

/// Initial consumer position when no committed offset exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    /// Start from the smallest available offset
    Earliest,
    /// Start from the log end
    #[default]
    Latest,
}

/// Delivery guarantee for the whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingGuarantee {
    /// Plain offset commits; replays possible after a crash
    #[default]
    AtLeastOnce,
    /// Kafka transactions enlisting input offsets
    ExactlyOnce,
}

/// What to do when a record fails to deserialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeserializeErrorPolicy {
    /// Halt the processing loop (default)
    #[default]
    Halt,
    /// Skip the record, advance the offset, bump a counter
    SkipAndCount,
}

/// Complete runtime configuration for a streamflow application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Kafka consumer group id; also the suffix of all derived topic names
    pub consumer_group: String,

    /// Stable application identifier used in the transactional id
    pub application_id: String,

    /// Initial position when no committed offset exists
    pub auto_offset_reset: AutoOffsetReset,

    /// Max wall time between checkpoints (ms)
    pub commit_interval_ms: u64,

    /// Max processed records between checkpoints
    pub commit_every: u64,

    /// At-least-once vs exactly-once (Kafka transactions)
    pub processing_guarantee: ProcessingGuarantee,

    /// When false, state is local-only and lost on reassignment
    pub use_changelog_topics: bool,

    /// Base directory for store partitions; `None` keeps state in memory
    pub state_dir: Option<PathBuf>,

    /// Consumer poll timeout (ms); bounds shutdown-signal latency
    pub poll_timeout_ms: u64,

    /// Producer flush budget per checkpoint (ms)
    pub flush_timeout_ms: u64,

    /// Bound on in-flight produced messages before the loop pauses polling
    pub producer_queue_limit: usize,

    /// Retention for derived repartition topics (ms)
    pub repartition_retention_ms: i64,

    /// Replication factor for derived topics
    pub replication_factor: i16,

    /// Policy for records that fail deserialization
    pub on_deserialize_error: DeserializeErrorPolicy,

    /// Raw tunables passed through to the producer adapter
    pub producer_extra_config: BTreeMap<String, String>,

    /// Raw tunables passed through to the consumer adapter
    pub consumer_extra_config: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new("streamflow")
    }
}

impl AppConfig {
    /// Create a configuration with defaults for the given consumer group.
    pub fn new(consumer_group: impl Into<String>) -> Self {
        let consumer_group = consumer_group.into();
        Self {
            application_id: consumer_group.clone(),
            consumer_group,
            auto_offset_reset: AutoOffsetReset::default(),
            commit_interval_ms: DEFAULT_COMMIT_INTERVAL_MS,
            commit_every: DEFAULT_COMMIT_EVERY,
            processing_guarantee: ProcessingGuarantee::default(),
            use_changelog_topics: true,
            state_dir: None,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            producer_queue_limit: DEFAULT_PRODUCER_QUEUE_LIMIT,
            repartition_retention_ms: DEFAULT_REPARTITION_RETENTION_MS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            on_deserialize_error: DeserializeErrorPolicy::default(),
            producer_extra_config: BTreeMap::new(),
            consumer_extra_config: BTreeMap::new(),
        }
    }

    pub fn with_auto_offset_reset(mut self, reset: AutoOffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_commit_interval_ms(mut self, ms: u64) -> Self {
        self.commit_interval_ms = ms;
        self
    }

    pub fn with_commit_every(mut self, records: u64) -> Self {
        self.commit_every = records;
        self
    }

    pub fn with_processing_guarantee(mut self, guarantee: ProcessingGuarantee) -> Self {
        self.processing_guarantee = guarantee;
        self
    }

    pub fn with_changelog_topics(mut self, enabled: bool) -> Self {
        self.use_changelog_topics = enabled;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_deserialize_error_policy(mut self, policy: DeserializeErrorPolicy) -> Self {
        self.on_deserialize_error = policy;
        self
    }

    /// Whether Kafka transactions are in play.
    pub fn exactly_once(&self) -> bool {
        self.processing_guarantee == ProcessingGuarantee::ExactlyOnce
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Deterministic transactional id for this application instance.
    ///
    /// Derived from the consumer group, the application id, and the sorted
    /// input topics so that the instance taking over an assignment also
    /// takes over the fencing token.
    pub fn transactional_id(&self, input_topics: &[String]) -> String {
        let mut topics: Vec<&str> = input_topics.iter().map(String::as_str).collect();
        topics.sort_unstable();
        format!(
            "{}--{}--{}",
            self.consumer_group,
            self.application_id,
            topics.join("-")
        )
    }

    /// Directory holding this group's store partitions, if state is on disk.
    pub fn group_state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|base| base.join(&self.consumer_group))
    }
}
