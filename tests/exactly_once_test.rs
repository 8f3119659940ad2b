//! Exactly-once integration tests
//!
//! With Kafka transactions enabled, produced output, changelog records,
//! and input offsets become visible atomically. A pipeline failure aborts
//! the transaction and leaves nothing readable at the broker.

mod common;

use bytes::Bytes;
use common::*;
use streamflow::{
    Application, InMemoryBroker, ProcessingContext, ProcessingGuarantee, ProcessingPhase, Result,
    Row, RowValue, RuntimeContext, StreamflowError, Topic, TopicConfig,
};

fn eos_config(group: &str) -> streamflow::AppConfig {
    app_config(group).with_processing_guarantee(ProcessingGuarantee::ExactlyOnce)
}

/// Word count under exactly-once: offsets ride in the transaction.
#[test]
fn test_exactly_once_word_count() {
    let broker = InMemoryBroker::new();
    seed_records(&broker, "words", 0, &["a b a", "a", "b b"]);

    let config = eos_config("g1");
    let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let words = string_topic("words", 1);
    app.add_store(&words, streamflow::DEFAULT_STORE_NAME);
    app.add_pipeline(&words, word_count_pipeline());

    app.start().unwrap();
    pump(&mut app, 3);

    // Nothing is visible before the checkpoint commits the transaction.
    assert_eq!(committed(&broker, "g1", "words", 0), None);
    assert_eq!(broker.high_watermark("changelog__g1--words--default", 0), 0);

    app.commit_checkpoint(true).unwrap();

    assert_eq!(committed(&broker, "g1", "words", 0), Some(3));
    assert_eq!(store_count(&app, "words", 0, "a"), Some(3));
    assert_eq!(store_count(&app, "words", 0, "b"), Some(3));
    assert!(!broker.records("changelog__g1--words--default", 0).is_empty());
}

/// A pipeline error aborts the transaction: no output, no offsets.
#[test]
fn test_pipeline_error_aborts_transaction() {
    let broker = InMemoryBroker::new();
    seed_records(&broker, "words", 0, &["ok", "boom"]);
    create_topic(&broker, "out", 1);

    let config = eos_config("g1");
    let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let words = string_topic("words", 1);
    let out = Topic::json("out").with_create_config(TopicConfig::new(1, 1));
    app.add_topic(out.clone());
    app.add_store(&words, streamflow::DEFAULT_STORE_NAME);
    app.add_pipeline(&words, {
        let out = out.clone();
        move |row: Row, ctx: &mut ProcessingContext<'_>| -> Result<()> {
            let text = row.value.as_str().unwrap_or_default().to_string();
            if text == "boom" {
                return Err(StreamflowError::Pipeline("bad record".to_string()));
            }
            ctx.emit(
                &out,
                Some(Bytes::from_static(b"k")),
                &RowValue::Json(serde_json::json!(text)),
            )?;
            ctx.state()?.set(text.as_bytes(), &1_u64)?;
            Ok(())
        }
    });

    app.start().unwrap();
    let err = loop {
        match app.process_once() {
            Ok(_) => {}
            Err(fatal) => break fatal,
        }
    };

    assert_eq!(err.phase, ProcessingPhase::Pipeline);
    // The aborted transaction left nothing readable behind.
    assert_eq!(committed(&broker, "g1", "words", 0), None);
    assert!(broker.records("out", 0).is_empty());
    assert!(broker.records("changelog__g1--words--default", 0).is_empty());
}

/// Committed output is atomic with offsets: after a clean checkpoint both
/// are visible together.
#[test]
fn test_output_and_offsets_commit_together() {
    let broker = InMemoryBroker::new();
    seed_records(&broker, "words", 0, &["x", "y"]);
    create_topic(&broker, "out", 1);

    let config = eos_config("g1");
    let mut app = Application::new(config.clone(), RuntimeContext::in_memory(&broker, &config));
    let words = string_topic("words", 1);
    let out = Topic::json("out").with_create_config(TopicConfig::new(1, 1));
    app.add_topic(out.clone());
    app.add_pipeline(&words, {
        let out = out.clone();
        move |row: Row, ctx: &mut ProcessingContext<'_>| -> Result<()> {
            ctx.emit(&out, row.key.clone(), &RowValue::Json(serde_json::json!(1)))
        }
    });

    app.start().unwrap();
    pump(&mut app, 3);
    assert!(broker.records("out", 0).is_empty());

    app.commit_checkpoint(true).unwrap();
    assert_eq!(broker.records("out", 0).len(), 2);
    assert_eq!(committed(&broker, "g1", "words", 0), Some(2));
}
