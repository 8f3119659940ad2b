//! Error types for streamflow
//!
//! This module defines the main error type used throughout streamflow plus
//! the domain-specific sub-errors it aggregates. Fatal runtime exits are
//! wrapped in [`FatalError`], which identifies the processing phase and the
//! offending topic partition so operators can tell a poisoned record from a
//! broken broker connection.

use std::fmt;

use thiserror::Error;

mod domain;

pub use domain::{ProducerError, RecoveryError, SerializationError, StoreError, TopicError};

/// Result type alias for streamflow operations
pub type Result<T> = std::result::Result<T, StreamflowError>;

/// Main error type for streamflow
#[derive(Error, Debug)]
pub enum StreamflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("no pipeline registered for topic: {0}")]
    PipelineNotRegistered(String),

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Fatal(Box<FatalError>),
}

impl From<FatalError> for StreamflowError {
    fn from(err: FatalError) -> Self {
        StreamflowError::Fatal(Box::new(err))
    }
}

impl StreamflowError {
    /// Whether the error is worth retrying at the adapter level.
    ///
    /// Only transient broker conditions qualify; everything else is either
    /// a per-record problem or a programming error.
    pub fn is_retriable(&self) -> bool {
        match self {
            StreamflowError::Broker(_) => true,
            StreamflowError::Producer(e) => e.is_retriable(),
            StreamflowError::Topic(TopicError::InspectionTimeout(_)) => true,
            _ => false,
        }
    }
}

/// Phase of the processing loop in which a fatal error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingPhase {
    Poll,
    Deserialize,
    Pipeline,
    Produce,
    Flush,
    Commit,
    StoreCommit,
    Recovery,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Poll => "poll",
            ProcessingPhase::Deserialize => "deserialize",
            ProcessingPhase::Pipeline => "pipeline",
            ProcessingPhase::Produce => "produce",
            ProcessingPhase::Flush => "flush",
            ProcessingPhase::Commit => "commit",
            ProcessingPhase::StoreCommit => "store-commit",
            ProcessingPhase::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal runtime error carrying the phase and record position it hit
#[derive(Debug)]
pub struct FatalError {
    /// Processing phase that failed
    pub phase: ProcessingPhase,
    /// Source topic of the record being processed, when applicable
    pub topic: Option<String>,
    /// Source partition of the record being processed, when applicable
    pub partition: Option<i32>,
    /// Offset of the record being processed, when applicable
    pub offset: Option<i64>,
    /// Underlying cause
    pub source: StreamflowError,
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl FatalError {
    pub fn new(phase: ProcessingPhase, source: StreamflowError) -> Self {
        Self {
            phase,
            topic: None,
            partition: None,
            offset: None,
            source,
        }
    }

    /// Attach the topic partition and offset the error occurred at.
    pub fn at(mut self, topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        self.topic = Some(topic.into());
        self.partition = Some(partition);
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal error in phase {}", self.phase)?;
        if let (Some(topic), Some(partition)) = (&self.topic, self.partition) {
            write!(f, " at {}[{}]", topic, partition)?;
            if let Some(offset) = self.offset {
                write!(f, "@{}", offset)?;
            }
        }
        write!(f, ": {}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_display_with_position() {
        let err = FatalError::new(
            ProcessingPhase::Flush,
            StreamflowError::Producer(ProducerError::FlushTimeout { pending: 3 }),
        )
        .at("words", 0, 37);

        let msg = err.to_string();
        assert!(msg.contains("phase flush"));
        assert!(msg.contains("words[0]@37"));
    }

    #[test]
    fn test_fatal_error_display_without_position() {
        let err = FatalError::new(
            ProcessingPhase::Commit,
            StreamflowError::Broker("coordinator moved".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("phase commit"));
        assert!(!msg.contains('@'));
    }

    #[test]
    fn test_phase_as_str() {
        assert_eq!(ProcessingPhase::StoreCommit.as_str(), "store-commit");
        assert_eq!(ProcessingPhase::Deserialize.as_str(), "deserialize");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(StreamflowError::Broker("timed out".into()).is_retriable());
        assert!(!StreamflowError::Pipeline("boom".into()).is_retriable());
        assert!(StreamflowError::Topic(TopicError::InspectionTimeout("t".into())).is_retriable());
    }
}
