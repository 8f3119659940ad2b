//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use streamflow::state::composite_key;
use streamflow::{
    AppConfig, Application, AutoOffsetReset, BrokerAdmin, BrokerProducer, InMemoryBroker,
    ProducerRecord, StringDeserializer, StringSerializer, Topic, TopicConfig, TopicPartition,
    PREFIX_DEFAULT,
};

/// Opt-in log output while debugging test runs (RUST_LOG=debug).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A plain-text topic: values are raw UTF-8 strings.
pub fn string_topic(name: &str, partitions: i32) -> Topic {
    Topic::new(name)
        .with_create_config(TopicConfig::new(partitions, 1))
        .with_value_deserializer(Arc::new(StringDeserializer))
        .with_value_serializer(Arc::new(StringSerializer))
}

/// Create a topic on the broker.
pub fn create_topic(broker: &InMemoryBroker, topic: &str, partitions: i32) {
    broker
        .create_topic(topic, &TopicConfig::new(partitions, 1))
        .unwrap();
}

/// Append raw string records to an existing topic partition.
pub fn seed_records(broker: &InMemoryBroker, topic: &str, partition: i32, values: &[&str]) {
    create_topic(broker, topic, partition + 1);
    let producer = broker.producer();
    for value in values {
        producer
            .produce(ProducerRecord {
                topic: topic.to_string(),
                partition: Some(partition),
                key: None,
                value: Some(Bytes::from(value.to_string())),
                headers: Vec::new(),
                timestamp: Some(0),
            })
            .unwrap();
    }
}

/// Base config used by the suites: earliest reset, manual-ish commits.
pub fn app_config(group: &str) -> AppConfig {
    AppConfig::new(group)
        .with_auto_offset_reset(AutoOffsetReset::Earliest)
        .with_commit_interval_ms(60_000)
        .with_commit_every(1_000)
}

/// Pump the loop until it reports no progress `idle_rounds` times in a row.
pub fn pump(app: &mut Application, idle_rounds: u32) {
    let mut idle = 0;
    while idle < idle_rounds {
        if app.process_once().unwrap() {
            idle = 0;
        } else {
            idle += 1;
        }
    }
}

/// Read a word count out of an application's live store.
pub fn store_count(app: &Application, topic: &str, partition: i32, word: &str) -> Option<u64> {
    let store = app
        .state_manager()
        .store(topic, streamflow::DEFAULT_STORE_NAME)
        .unwrap();
    let partition = store.partition(partition)?;
    let bytes = partition
        .lock()
        .get(&composite_key(PREFIX_DEFAULT, word.as_bytes()))?;
    serde_json::from_slice(&bytes).ok()
}

/// The word-count pipeline used across the suites.
pub fn word_count_pipeline(
) -> impl FnMut(streamflow::Row, &mut streamflow::ProcessingContext<'_>) -> streamflow::Result<()>
       + Send {
    |row: streamflow::Row,
     ctx: &mut streamflow::ProcessingContext<'_>|
     -> streamflow::Result<()> {
        if let Some(text) = row.value.as_str() {
            let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            for word in words {
                let mut state = ctx.state()?;
                let count: u64 = state.get(word.as_bytes())?.unwrap_or(0);
                state.set(word.as_bytes(), &(count + 1))?;
            }
        }
        Ok(())
    }
}

/// Committed next-offset for a group partition.
pub fn committed(broker: &InMemoryBroker, group: &str, topic: &str, partition: i32) -> Option<i64> {
    broker.committed_offset(group, &TopicPartition::new(topic, partition))
}
