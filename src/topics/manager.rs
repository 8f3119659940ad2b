//! Topic manager
//!
//! Canonical source of all [`Topic`] objects for one application instance,
//! including the derived changelog and repartition topics. Topics are held
//! by name; nothing here keeps a reference back into the runtime.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::broker::BrokerAdmin;
use crate::error::{Result, TopicError};

use super::config::{CLEANUP_POLICY, MIN_COMPACTION_LAG_MS, RETENTION_BYTES, RETENTION_MS};
use super::{Topic, TopicConfig};

/// Name prefix of derived changelog topics
pub const CHANGELOG_PREFIX: &str = "changelog__";
/// Name prefix of derived repartition topics
pub const REPARTITION_PREFIX: &str = "repartition__";

#[derive(Debug, Clone)]
struct ChangelogEntry {
    source: String,
    store: String,
}

/// Catalog of logical topics: inputs, repartitions, changelogs
pub struct TopicManager {
    consumer_group: String,
    replication_factor: i16,
    repartition_retention_ms: i64,
    topics: BTreeMap<String, Topic>,
    changelogs: BTreeMap<String, ChangelogEntry>,
    changelog_topics: BTreeMap<String, Topic>,
    repartitions: BTreeMap<String, Topic>,
}

impl TopicManager {
    pub fn new(
        consumer_group: impl Into<String>,
        replication_factor: i16,
        repartition_retention_ms: i64,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            replication_factor,
            repartition_retention_ms,
            topics: BTreeMap::new(),
            changelogs: BTreeMap::new(),
            changelog_topics: BTreeMap::new(),
            repartitions: BTreeMap::new(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Register a topic; registering the same name twice keeps the first.
    /// Derived topics keep their place in the derived catalogs.
    pub fn register(&mut self, topic: Topic) -> Topic {
        if let Some(existing) = self.topic(topic.name()) {
            return existing.clone();
        }
        self.topics
            .entry(topic.name().to_string())
            .or_insert(topic)
            .clone()
    }

    /// Look up a registered topic by name, in any of the catalogs.
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics
            .get(name)
            .or_else(|| self.changelog_topics.get(name))
            .or_else(|| self.repartitions.get(name))
    }

    /// Names of registered input/repartition topics (the consumable set).
    pub fn input_topic_names(&self) -> Vec<String> {
        self.topics
            .keys()
            .chain(self.repartitions.keys())
            .cloned()
            .collect()
    }

    /// Derived changelog topic name for (source topic, store name).
    pub fn changelog_name(&self, source: &str, store: &str) -> String {
        format!(
            "{}{}--{}--{}",
            CHANGELOG_PREFIX, self.consumer_group, source, store
        )
    }

    /// Derived repartition topic name for (source topic, operation).
    pub fn repartition_name(&self, source: &str, operation: &str) -> String {
        format!(
            "{}{}--{}--{}",
            REPARTITION_PREFIX, self.consumer_group, source, operation
        )
    }

    /// Derive and register the changelog topic for a store.
    ///
    /// Partition count mirrors the source topic; the config pins compaction
    /// and unbounded retention so live keys are never dropped.
    pub fn changelog_topic(&mut self, source: &str, store: &str) -> Result<Topic> {
        let name = self.changelog_name(source, store);
        if let Some(existing) = self.changelog_topics.get(&name) {
            return Ok(existing.clone());
        }

        let partitions = self.source_partition_count(source)?;
        let config = TopicConfig::new(partitions, self.replication_factor)
            .with_config(CLEANUP_POLICY, "compact")
            .with_config(MIN_COMPACTION_LAG_MS, "0")
            .with_config(RETENTION_MS, "-1")
            .with_config(RETENTION_BYTES, "-1");

        debug!(changelog = %name, source = %source, store = %store, partitions, "derived changelog topic");
        let topic = Topic::new(name.clone()).with_create_config(config);
        self.changelogs.insert(
            name.clone(),
            ChangelogEntry {
                source: source.to_string(),
                store: store.to_string(),
            },
        );
        self.changelog_topics.insert(name, topic.clone());
        Ok(topic)
    }

    /// Derive and register the repartition topic for a group-by operation.
    pub fn repartition_topic(&mut self, source: &str, operation: &str) -> Result<Topic> {
        let name = self.repartition_name(source, operation);
        if let Some(existing) = self.repartitions.get(&name) {
            return Ok(existing.clone());
        }

        let partitions = self.source_partition_count(source)?;
        let config = TopicConfig::new(partitions, self.replication_factor)
            .with_config(CLEANUP_POLICY, "delete")
            .with_config(RETENTION_MS, self.repartition_retention_ms.to_string());

        debug!(repartition = %name, source = %source, operation = %operation, partitions, "derived repartition topic");
        let topic = Topic::json(name.clone()).with_create_config(config);
        self.repartitions.insert(name, topic.clone());
        Ok(topic)
    }

    /// Changelog topic names registered for a source topic.
    pub fn changelogs_for(&self, source: &str) -> Vec<(String, String)> {
        self.changelogs
            .iter()
            .filter(|(_, entry)| entry.source == source)
            .map(|(name, entry)| (name.clone(), entry.store.clone()))
            .collect()
    }

    /// Create every registered topic and fill in broker configs.
    ///
    /// Creating a topic that already exists is a success. Externally managed
    /// topics (no create config) are only inspected; a missing one is fatal.
    pub fn ensure_topics_exist(&mut self, admin: &dyn BrokerAdmin) -> Result<()> {
        let names: Vec<String> = self
            .topics
            .keys()
            .chain(self.changelog_topics.keys())
            .chain(self.repartitions.keys())
            .cloned()
            .collect();

        for name in names {
            let create_config = self
                .topic(&name)
                .and_then(|t| t.create_config().cloned());

            if let Some(config) = create_config {
                admin.create_topic(&name, &config).map_err(|e| {
                    TopicError::CreationFailed {
                        topic: name.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }

            let broker_config = admin
                .describe_topic(&name)?
                .ok_or_else(|| TopicError::TopicNotFound(name.clone()))?;

            info!(topic = %name, partitions = broker_config.num_partitions, "topic ready");
            self.set_broker_config(&name, broker_config);
        }
        Ok(())
    }

    /// Validate every registered topic; violations are collected and raised
    /// as one aggregated failure.
    pub fn validate_all(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (name, topic) in self
            .topics
            .iter()
            .chain(self.changelog_topics.iter())
            .chain(self.repartitions.iter())
        {
            if topic.broker_config().is_none() {
                problems.push(format!("broker config for topic {} was never inspected", name));
            }
        }

        for (name, entry) in &self.changelogs {
            let Some(changelog) = self.changelog_topics.get(name) else {
                continue;
            };
            let Some(config) = changelog.broker_config() else {
                // Already reported above.
                continue;
            };
            if !config.is_compacted() {
                problems.push(format!("changelog topic {} is not compacted", name));
            }
            if let Some(source_partitions) = self
                .topic(&entry.source)
                .and_then(|t| t.partition_count())
            {
                if config.num_partitions != source_partitions {
                    problems.push(format!(
                        "changelog {} has {} partitions but source topic has {}",
                        name, config.num_partitions, source_partitions
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TopicError::Validation(problems).into())
        }
    }

    fn source_partition_count(&self, source: &str) -> Result<i32> {
        self.topic(source)
            .and_then(|t| t.partition_count())
            .ok_or_else(|| TopicError::TopicNotFound(source.to_string()).into())
    }

    fn set_broker_config(&mut self, name: &str, config: TopicConfig) {
        if let Some(topic) = self.topics.get_mut(name) {
            topic.set_broker_config(config);
        } else if let Some(topic) = self.changelog_topics.get_mut(name) {
            topic.set_broker_config(config);
        } else if let Some(topic) = self.repartitions.get_mut(name) {
            topic.set_broker_config(config);
        }
    }
}
