//! Repartition (group-by) integration tests
//!
//! A pipeline re-keys its stream through a derived repartition topic; a
//! second pipeline consumes the repartitioned stream and aggregates per
//! key, with its own store and changelog. Also covers deserializer array
//! fan-out end to end.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use streamflow::{
    Application, InMemoryBroker, JsonDeserializer, JsonSerializer, ProcessingContext, Result, Row,
    RuntimeContext, Topic, TopicConfig,
};

#[test]
fn test_group_by_through_repartition_topic() {
    let broker = InMemoryBroker::new();
    seed_records(
        &broker,
        "clicks",
        0,
        &[
            r#"{"user": "u1"}"#,
            r#"{"user": "u2"}"#,
            r#"{"user": "u1"}"#,
        ],
    );

    let config = app_config("g1");
    let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let clicks = Topic::json("clicks").with_create_config(TopicConfig::new(1, 1));
    let by_user = app.repartition_topic(&clicks, "by-user").unwrap();
    assert_eq!(by_user.name(), "repartition__g1--clicks--by-user");

    // Stage 1: re-key each click by its user id.
    app.add_pipeline(&clicks, {
        let by_user = by_user.clone();
        move |row: Row, ctx: &mut ProcessingContext<'_>| -> Result<()> {
            let user = row.value.as_json().and_then(|v| v["user"].as_str()).map(str::to_string);
            if let Some(user) = user {
                ctx.emit(&by_user, Some(Bytes::from(user)), &row.value)?;
            }
            Ok(())
        }
    });

    // Stage 2: count clicks per user on the repartitioned stream.
    app.add_store(&by_user, streamflow::DEFAULT_STORE_NAME);
    app.add_pipeline(&by_user, {
        move |row: Row, ctx: &mut ProcessingContext<'_>| -> Result<()> {
            let key = row.key.clone().unwrap_or_default();
            let mut state = ctx.state()?;
            let count: u64 = state.get(&key)?.unwrap_or(0);
            state.set(&key, &(count + 1))?;
            Ok(())
        }
    });

    app.start().unwrap();
    // Both stages run in the same loop: stage 1 emits, stage 2 picks the
    // repartitioned records up on subsequent polls.
    pump(&mut app, 5);
    app.commit_checkpoint(true).unwrap();
    pump(&mut app, 5);
    app.commit_checkpoint(true).unwrap();

    let rp = by_user.name();
    assert_eq!(broker.records(rp, 0).len(), 3);
    assert_eq!(store_count(&app, rp, 0, "u1"), Some(2));
    assert_eq!(store_count(&app, rp, 0, "u2"), Some(1));

    // The repartition topic carries the retention/delete config.
    use streamflow::BrokerAdmin as _;
    let rp_config = broker.describe_topic(rp).unwrap().unwrap();
    assert_eq!(rp_config.config("cleanup.policy"), Some("delete"));

    // The store on the repartitioned stream has its own changelog.
    let changelog = format!("changelog__g1--{}--default", rp);
    assert!(!broker.records(&changelog, 0).is_empty());
}

#[test]
fn test_array_fan_out_end_to_end() {
    let broker = InMemoryBroker::new();
    seed_records(&broker, "batches", 0, &[r#"["a", "b", "a"]"#, r#"["a"]"#]);

    let config = app_config("g1");
    let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let batches = Topic::new("batches")
        .with_create_config(TopicConfig::new(1, 1))
        .with_value_deserializer(Arc::new(JsonDeserializer::new().expand_arrays()))
        .with_value_serializer(Arc::new(JsonSerializer));
    app.add_store(&batches, streamflow::DEFAULT_STORE_NAME);
    app.add_pipeline(
        &batches,
        |row: Row, ctx: &mut ProcessingContext<'_>| -> Result<()> {
            if let Some(item) = row.value.as_str() {
                let mut state = ctx.state()?;
                let count: u64 = state.get(item.as_bytes())?.unwrap_or(0);
                state.set(item.as_bytes(), &(count + 1))?;
            }
            Ok(())
        },
    );

    app.start().unwrap();
    pump(&mut app, 3);
    app.commit_checkpoint(true).unwrap();

    // Two input records fanned out into four rows.
    assert_eq!(app.stats().processed_records, 2);
    assert_eq!(store_count(&app, "batches", 0, "a"), Some(3));
    assert_eq!(store_count(&app, "batches", 0, "b"), Some(1));
    assert_eq!(committed(&broker, "g1", "batches", 0), Some(2));
}
