use crate::error::{BatchError, ProcessingError};
use aws_lambda_events::event::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest batch the Lambda SQS event source delivers with default settings.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
const SENT_TIMESTAMP: &str = "SentTimestamp";
const MESSAGE_GROUP_ID: &str = "MessageGroupId";

/// A single message as delivered to this invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub receipt_handle: Option<String>,
    pub body: String,
    /// System attributes such as `SenderId` or `ApproximateReceiveCount`.
    pub attributes: HashMap<String, String>,
    /// String-valued message attributes set by the producer.
    pub message_attributes: HashMap<String, String>,
}

impl MessageRecord {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_message_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.message_attributes.insert(key.into(), value.into());
        self
    }

    /// Number of times the queue has handed this message out, including this one.
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .get(APPROXIMATE_RECEIVE_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }

    /// Milliseconds since the epoch at which the producer sent the message.
    pub fn sent_timestamp(&self) -> Option<u64> {
        self.attributes
            .get(SENT_TIMESTAMP)
            .and_then(|ts| ts.parse().ok())
    }

    /// Ordering group on FIFO queues.
    pub fn group_id(&self) -> Option<&str> {
        self.attributes.get(MESSAGE_GROUP_ID).map(String::as_str)
    }

    /// Key under which side effects for this message are deduplicated.
    /// Redeliveries keep the same message id, so it is stable across attempts.
    pub fn deduplication_key(&self) -> String {
        format!("message#{}", self.message_id)
    }

    fn from_sqs_message(position: usize, message: SqsMessage) -> Result<Self, BatchError> {
        let message_id = message
            .message_id
            .filter(|id| !id.is_empty())
            .ok_or(BatchError::MissingMessageId { position })?;

        let message_attributes = message
            .message_attributes
            .into_iter()
            .filter_map(|(key, attribute)| attribute.string_value.map(|value| (key, value)))
            .collect();

        Ok(Self {
            message_id,
            receipt_handle: message.receipt_handle,
            body: message.body.unwrap_or_default(),
            attributes: message.attributes,
            message_attributes,
        })
    }
}

/// The ordered records of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<MessageRecord>,
}

impl Batch {
    pub fn new(records: Vec<MessageRecord>, max_size: usize) -> Result<Self, BatchError> {
        if records.len() > max_size {
            return Err(BatchError::TooLarge {
                size: records.len(),
                max: max_size,
            });
        }
        if let Some(position) = records.iter().position(|r| r.message_id.is_empty()) {
            return Err(BatchError::MissingMessageId { position });
        }
        Ok(Self { records })
    }

    pub fn from_sqs_event(event: SqsEvent, max_size: usize) -> Result<Self, BatchError> {
        if event.records.len() > max_size {
            return Err(BatchError::TooLarge {
                size: event.records.len(),
                max: max_size,
            });
        }

        let records = event
            .records
            .into_iter()
            .enumerate()
            .map(|(position, message)| MessageRecord::from_sqs_message(position, message))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { records })
    }

    /// Decodes the raw invocation payload. Anything that is not an SQS event
    /// is rejected before a single record is looked at.
    pub fn from_payload(payload: serde_json::Value, max_size: usize) -> Result<Self, BatchError> {
        let event: SqsEvent = serde_json::from_value(payload)?;
        Self::from_sqs_event(event, max_size)
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.records.iter().any(|r| r.message_id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    Failure(ProcessingError),
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }
}

/// Ids of the records that failed, in batch order and without repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    total: usize,
    failed: Vec<String>,
}

impl BatchResult {
    pub(crate) fn from_outcomes(batch: &Batch, outcomes: Vec<ProcessingOutcome>) -> Self {
        debug_assert_eq!(batch.len(), outcomes.len());

        let mut seen = HashSet::new();
        let failed = batch
            .records()
            .iter()
            .zip(outcomes)
            .filter(|(_, outcome)| !outcome.is_success())
            .filter(|(record, _)| seen.insert(record.message_id.clone()))
            .map(|(record, _)| record.message_id.clone())
            .collect();

        Self {
            total: batch.len(),
            failed,
        }
    }

    pub fn failed_ids(&self) -> &[String] {
        &self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.failed.iter().any(|id| id == message_id)
    }

    /// Partial batch response: only the listed messages are redelivered.
    pub fn into_sqs_batch_response(self) -> SqsBatchResponse {
        let mut response = SqsBatchResponse::default();
        response.batch_item_failures = self
            .failed
            .into_iter()
            .map(|message_id| {
                let mut failure = BatchItemFailure::default();
                failure.item_identifier = message_id;
                failure
            })
            .collect();
        response
    }

    /// For event source mappings without `ReportBatchItemFailures`: any
    /// failure fails the invocation so the whole batch is redelivered.
    pub fn into_all_or_nothing(self) -> Result<(), BatchError> {
        if self.failed.is_empty() {
            return Ok(());
        }
        Err(BatchError::PartialFailure {
            failed: self.failed.len(),
            total: self.total,
            message_ids: self.failed,
        })
    }
}

/// Per-invocation handle passed explicitly to the dispatcher and processors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    pub request_id: String,
    pub invoked_function_arn: String,
    pub deadline: Option<SystemTime>,
}

impl InvocationContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Time left before the runtime cancels the invocation.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.duration_since(SystemTime::now()).unwrap_or_default())
    }
}

impl From<&lambda_runtime::Context> for InvocationContext {
    fn from(context: &lambda_runtime::Context) -> Self {
        let deadline = (context.deadline > 0)
            .then(|| UNIX_EPOCH + Duration::from_millis(context.deadline));
        Self {
            request_id: context.request_id.clone(),
            invoked_function_arn: context.invoked_function_arn.clone(),
            deadline,
        }
    }
}
