//! Topics: configs, logical topics, and the topic manager

mod config;
mod manager;
mod topic;

pub use config::{
    TopicConfig, CLEANUP_POLICY, MIN_COMPACTION_LAG_MS, RETENTION_BYTES, RETENTION_MS,
};
pub use manager::{TopicManager, CHANGELOG_PREFIX, REPARTITION_PREFIX};
pub use topic::Topic;
