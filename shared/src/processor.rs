use crate::core::{InvocationContext, MessageRecord};
use crate::error::{Error, ProcessingError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// The unit of work applied to a single record.
///
/// Implementations must be safe to run more than once for the same message:
/// the queue delivers at least once, and a record whose invocation is cancelled
/// comes back after its visibility timeout. Wrap side-effecting processors in
/// [`crate::deduplication::Deduplicated`] to get that for free.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, ctx: &InvocationContext, record: &MessageRecord) -> Result<(), Error>;

    /// Called after `process` was cut short by a timeout or a panic, so any
    /// state it left behind for `record` can be undone.
    async fn abandon(
        &self,
        _ctx: &InvocationContext,
        _record: &MessageRecord,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Turns a panic inside `work` into a [`ProcessingError::Panicked`].
pub(crate) async fn catch_panic<F>(work: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ProcessingError::Panicked(panic_message(panic)).into()),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Acknowledges a message by writing it to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl MessageProcessor for LoggingProcessor {
    async fn process(&self, ctx: &InvocationContext, record: &MessageRecord) -> Result<(), Error> {
        tracing::info!(
            request_id = %ctx.request_id,
            message_id = %record.message_id,
            receive_count = record.receive_count(),
            "Processed message {}",
            record.body
        );
        Ok(())
    }
}
