use thiserror::Error;

use crate::config::ConfigurationError;
use crate::entity::StoreError;
use crate::job::JobQueueError;

/// Crate-level error for the reconfiguration agent core
#[derive(Debug, Error)]
pub enum ReconfigurationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job queue error: {0}")]
    JobQueue(#[from] JobQueueError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Stale notification for {key}: sequence {sequence_number} is not newer than {current}")]
    Stale {
        key: String,
        sequence_number: u64,
        current: u64,
    },

    #[error("Agent is not open")]
    NotOpen,

    #[error("Agent is closed")]
    Closed,
}

/// Failure reported by a job processor.
///
/// Returned from the processor closure instead of panicking; the entity state is left
/// untouched and the job's action queue is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("Entity {entity} not found")]
    EntityNotFound { entity: String },

    #[error("Entity {entity} is in a terminal state")]
    EntityTerminal { entity: String },

    #[error("Invalid message for {entity}: {reason}")]
    InvalidMessage { entity: String, reason: String },

    #[error("Store commit failed: {0}")]
    Commit(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

impl ProcessingError {
    pub fn invalid_message(entity: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconfigurationError>;
