//! Topic configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Broker config key for the cleanup policy
pub const CLEANUP_POLICY: &str = "cleanup.policy";
/// Broker config key for time retention
pub const RETENTION_MS: &str = "retention.ms";
/// Broker config key for size retention
pub const RETENTION_BYTES: &str = "retention.bytes";
/// Broker config key for the minimum compaction lag
pub const MIN_COMPACTION_LAG_MS: &str = "min.compaction.lag.ms";

/// Immutable description of a topic used for creation and validation
///
/// Equality is by value: two configs are interchangeable when every field
/// matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Partition count
    pub num_partitions: i32,
    /// Replication factor
    pub replication_factor: i16,
    /// Raw broker config entries
    pub extra_config: BTreeMap<String, String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl TopicConfig {
    pub fn new(num_partitions: i32, replication_factor: i16) -> Self {
        Self {
            num_partitions,
            replication_factor,
            extra_config: BTreeMap::new(),
        }
    }

    /// Add one broker config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_config.insert(key.into(), value.into());
        self
    }

    pub fn config(&self, key: &str) -> Option<&str> {
        self.extra_config.get(key).map(String::as_str)
    }

    /// Whether the cleanup policy includes compaction.
    pub fn is_compacted(&self) -> bool {
        self.config(CLEANUP_POLICY)
            .map(|p| p.split(',').any(|part| part.trim() == "compact"))
            .unwrap_or(false)
    }
}
