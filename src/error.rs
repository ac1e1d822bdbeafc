//! Error types for queue operations.
//!
//! Validation failures reach the caller of `enqueue` synchronously, store
//! failures abort whole batches, and transport failures are contained to the
//! task being sent.

use std::time::Duration;

use thiserror::Error;

use crate::models::TaskId;

/// A draft that cannot be queued. Nothing has been written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Subject not set")]
    MissingSubject,

    #[error("Contents not set")]
    MissingContents,

    #[error("Authors not set")]
    MissingAuthors,

    #[error("Recipients not set")]
    MissingRecipients,

    #[error("Empty address in {0}")]
    EmptyAddress(&'static str),

    #[error("Unknown encoding {0:?}")]
    UnknownEncoding(String),

    #[error("Can't set context identifier without setting context")]
    ContextIdentifierWithoutContext,

    #[error("Attachment {index}: {field} not set")]
    IncompleteAttachment { index: usize, field: &'static str },

    #[error("Invalid header {0:?}")]
    InvalidHeader(String),
}

/// Persistence failure in a `QueueStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupted column {column} on task {task_id}: {reason}")]
    Corrupted {
        task_id: TaskId,
        column: &'static str,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A single send attempt failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Recipients rejected by delivery policy: {0}")]
    Rejected(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Provider(String),
}

impl From<anyhow::Error> for TransportError {
    fn from(e: anyhow::Error) -> Self {
        Self::Provider(format!("{e:#}"))
    }
}

/// Umbrella error for the public queue entry points.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;
