use crate::core::{InvocationContext, MessageRecord};
use crate::error::{Error, ProcessingError};
use crate::processor::{catch_panic, MessageProcessor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    /// The caller now holds the key and must `complete` or `release` it.
    Claimed,
    AlreadyCompleted,
    /// Another invocation holds an unexpired lock on the key.
    InProgress,
}

/// Tracks which messages have been processed.
///
/// `owner` identifies the invocation holding a claim. `complete` and `release`
/// only act on a claim still held by the same owner, so an invocation whose
/// lock expired cannot touch the claim of the one that took over.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn begin(&self, key: &str, owner: &str) -> Result<ClaimStatus, String>;
    async fn complete(&self, key: &str, owner: &str) -> Result<(), String>;
    async fn release(&self, key: &str, owner: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
enum Entry {
    InProgress { owner: String, expires_at: Instant },
    Completed { expires_at: Instant },
}

impl Entry {
    fn expires_at(&self) -> Instant {
        match self {
            Entry::InProgress { expires_at, .. } | Entry::Completed { expires_at } => *expires_at,
        }
    }

    fn is_held_by(&self, claimant: &str) -> bool {
        matches!(self, Entry::InProgress { owner, .. } if owner == claimant)
    }
}

/// Keeps keys for the lifetime of a warm execution environment.
#[derive(Debug)]
pub struct InMemoryDeduplicationStore {
    lock_timeout: Duration,
    retention: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryDeduplicationStore {
    pub fn new(lock_timeout: Duration, retention: Duration) -> Self {
        Self {
            lock_timeout,
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, String> {
        self.entries
            .lock()
            .map_err(|e| format!("Deduplication store lock poisoned: {}", e))
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    async fn begin(&self, key: &str, owner: &str) -> Result<ClaimStatus, String> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        entries.retain(|_, entry| entry.expires_at() > now);

        match entries.get(key) {
            Some(Entry::Completed { .. }) => return Ok(ClaimStatus::AlreadyCompleted),
            Some(Entry::InProgress { .. }) => return Ok(ClaimStatus::InProgress),
            None => {}
        }

        entries.insert(
            key.to_string(),
            Entry::InProgress {
                owner: owner.to_string(),
                expires_at: now + self.lock_timeout,
            },
        );
        Ok(ClaimStatus::Claimed)
    }

    async fn complete(&self, key: &str, owner: &str) -> Result<(), String> {
        let mut entries = self.entries()?;
        if !entries.get(key).is_some_and(|entry| entry.is_held_by(owner)) {
            return Err(format!("Claim on {} is no longer held by {}", key, owner));
        }
        entries.insert(
            key.to_string(),
            Entry::Completed {
                expires_at: Instant::now() + self.retention,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), String> {
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|entry| entry.is_held_by(owner)) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Runs the inner processor at most once to completion per deduplication key.
///
/// Claims are owned by the invocation's request id. Any failure of the inner
/// processor, including a panic, releases the claim so a redelivery can retry.
/// When the caller cancels `process`, it must call `abandon` to do the same.
pub struct Deduplicated<P> {
    inner: P,
    store: Arc<dyn DeduplicationStore>,
}

impl<P: MessageProcessor> Deduplicated<P> {
    pub fn new(inner: P, store: Arc<dyn DeduplicationStore>) -> Self {
        Self { inner, store }
    }

    async fn release(&self, ctx: &InvocationContext, record: &MessageRecord) -> Result<(), String> {
        self.store
            .release(&record.deduplication_key(), &ctx.request_id)
            .await
            .inspect_err(|e| {
                tracing::error!("Failed to release message {}: {}", record.message_id, e)
            })
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for Deduplicated<P> {
    async fn process(&self, ctx: &InvocationContext, record: &MessageRecord) -> Result<(), Error> {
        let key = record.deduplication_key();

        match self
            .store
            .begin(&key, &ctx.request_id)
            .await
            .map_err(ProcessingError::Deduplication)?
        {
            ClaimStatus::Claimed => {}
            ClaimStatus::AlreadyCompleted => {
                tracing::info!(
                    "Skipping message {} as it was already processed",
                    record.message_id
                );
                return Ok(());
            }
            ClaimStatus::InProgress => {
                return Err(Box::new(ProcessingError::InProgress(
                    record.message_id.clone(),
                )));
            }
        }

        match catch_panic(self.inner.process(ctx, record)).await {
            Ok(()) => {
                // The work is done; a failure here only risks a repeat on redelivery.
                if let Err(e) = self.store.complete(&key, &ctx.request_id).await {
                    tracing::warn!(
                        "Failed to mark message {} as processed: {}",
                        record.message_id,
                        e
                    );
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.release(ctx, record).await;
                Err(e)
            }
        }
    }

    async fn abandon(&self, ctx: &InvocationContext, record: &MessageRecord) -> Result<(), Error> {
        let inner_result = self.inner.abandon(ctx, record).await;
        self.release(ctx, record)
            .await
            .map_err(ProcessingError::Deduplication)?;
        inner_result
    }
}
