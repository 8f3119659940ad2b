//! Rebalance integration tests
//!
//! Two instances sharing a group on a two-partition topic: the first
//! instance owns everything, a second joins mid-batch, the revocation
//! checkpoint commits uncommitted progress, and the new owner replays the
//! changelog before resuming at the committed offset.

mod common;

use common::*;
use streamflow::{Application, InMemoryBroker, RuntimeContext, TopicPartition};

#[test]
fn test_rebalance_hands_off_state_and_offsets() {
    let broker = InMemoryBroker::new();
    create_topic(&broker, "events", 2);
    let p0_values = vec!["zero"; 10];
    let p1_values = vec!["one"; 12];
    seed_records(&broker, "events", 0, &p0_values);
    seed_records(&broker, "events", 1, &p1_values);

    let config = app_config("g1");
    let mut app1 = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let events = string_topic("events", 2);
    app1.add_store(&events, streamflow::DEFAULT_STORE_NAME);
    app1.add_pipeline(&events, word_count_pipeline());

    // Instance 1 processes both partitions without committing.
    app1.start().unwrap();
    pump(&mut app1, 3);
    assert_eq!(app1.stats().processed_records, 22);
    assert_eq!(committed(&broker, "g1", "events", 0), None);
    assert_eq!(committed(&broker, "g1", "events", 1), None);

    // Instance 2 joins the group.
    let config2 = app_config("g1");
    let mut app2 =
        Application::new(config2.clone(), RuntimeContext::in_memory(&broker, &config2));
    let events2 = string_topic("events", 2);
    app2.add_store(&events2, streamflow::DEFAULT_STORE_NAME);
    app2.add_pipeline(&events2, word_count_pipeline());
    app2.start().unwrap();

    // Instance 1 observes the revocation and takes its final checkpoint.
    pump(&mut app1, 3);
    assert_eq!(committed(&broker, "g1", "events", 0), Some(10));
    assert_eq!(committed(&broker, "g1", "events", 1), Some(12));

    // Instance 2 recovers its half of the state and replays nothing.
    pump(&mut app2, 3);
    assert_eq!(app2.stats().processed_records, 0);

    let tp0 = TopicPartition::new("events", 0);
    let tp1 = TopicPartition::new("events", 1);
    let app2_tps: Vec<&TopicPartition> = [&tp0, &tp1]
        .into_iter()
        .filter(|tp| app2.watermark(tp).is_some())
        .collect();
    assert_eq!(app2_tps.len(), 1, "the group splits one partition each");

    let owned = app2_tps[0];
    let (word, expected) = if owned.partition == 0 {
        ("zero", 10)
    } else {
        ("one", 12)
    };
    assert_eq!(
        store_count(&app2, "events", owned.partition, word),
        Some(expected),
        "recovered count for {}",
        owned
    );
    assert!(app2.stats().recoveries_completed >= 1);

    // Both instances keep processing new records on their halves.
    seed_records(&broker, "events", 0, &["zero"]);
    seed_records(&broker, "events", 1, &["one"]);
    pump(&mut app1, 3);
    pump(&mut app2, 3);
    assert_eq!(app2.stats().processed_records, 1);
}

#[test]
fn test_single_instance_survives_close_and_replacement() {
    let broker = InMemoryBroker::new();
    seed_records(&broker, "events", 0, &["a a", "b"]);

    let config = app_config("g1");
    let mut app1 = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let events = string_topic("events", 1);
    app1.add_store(&events, streamflow::DEFAULT_STORE_NAME);
    app1.add_pipeline(&events, word_count_pipeline());
    app1.start().unwrap();
    pump(&mut app1, 3);
    // Close takes the final checkpoint and leaves the group.
    app1.close().unwrap();
    assert_eq!(committed(&broker, "g1", "events", 0), Some(2));

    let config2 = app_config("g1");
    let mut app2 =
        Application::new(config2.clone(), RuntimeContext::in_memory(&broker, &config2));
    let events2 = string_topic("events", 1);
    app2.add_store(&events2, streamflow::DEFAULT_STORE_NAME);
    app2.add_pipeline(&events2, word_count_pipeline());
    app2.start().unwrap();
    pump(&mut app2, 3);

    // The replacement recovered the counts and re-processed nothing.
    assert_eq!(app2.stats().processed_records, 0);
    assert_eq!(store_count(&app2, "events", 0, "a"), Some(2));
    assert_eq!(store_count(&app2, "events", 0, "b"), Some(1));
}

/// An on-revoke with no state change completes without touching offsets.
#[test]
fn test_revoke_with_no_progress_commits_nothing() {
    let broker = InMemoryBroker::new();
    create_topic(&broker, "events", 2);

    let config = app_config("g1");
    let mut app1 = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let events = string_topic("events", 2);
    app1.add_pipeline(&events, word_count_pipeline());
    app1.start().unwrap();
    pump(&mut app1, 2);

    let config2 = app_config("g1");
    let mut app2 =
        Application::new(config2.clone(), RuntimeContext::in_memory(&broker, &config2));
    let events2 = string_topic("events", 2);
    app2.add_pipeline(&events2, word_count_pipeline());
    app2.start().unwrap();

    pump(&mut app1, 2);
    pump(&mut app2, 2);

    assert_eq!(app1.stats().checkpoints_committed, 0);
    assert_eq!(committed(&broker, "g1", "events", 0), None);
    assert_eq!(committed(&broker, "g1", "events", 1), None);
}
