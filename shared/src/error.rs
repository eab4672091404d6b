use std::time::Duration;
use thiserror::Error;

/// Boxed error returned across trait seams.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A failure confined to a single record. The dispatcher turns every one of
/// these into a `Failure` outcome; none of them abort the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Failed(String),
    #[error("processing panicked: {0}")]
    Panicked(String),
    #[error("processing timed out after {0:?}")]
    TimedOut(Duration),
    #[error("message {0} is being processed by another invocation")]
    InProgress(String),
    #[error("deduplication store error: {0}")]
    Deduplication(String),
}

/// A failure that concerns the batch as a whole and is reported to the
/// runtime, which then retries the entire invocation.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("malformed batch payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record at position {position} has no message id")]
    MissingMessageId { position: usize },
    #[error("batch of {size} records exceeds the configured maximum of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("{failed} of {total} records failed processing: {message_ids:?}")]
    PartialFailure {
        failed: usize,
        total: usize,
        message_ids: Vec<String>,
    },
}
