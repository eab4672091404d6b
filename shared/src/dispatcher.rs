use crate::core::{Batch, BatchResult, InvocationContext, MessageRecord, ProcessingOutcome};
use crate::error::ProcessingError;
use crate::observability::add_span_link_from_record;
use crate::processor::{catch_panic, MessageProcessor};
use opentelemetry::global;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How the records of one batch are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Sequential,
    #[default]
    Concurrent,
    /// FIFO queues: one record at a time per `MessageGroupId`, groups in parallel.
    OrderedByGroup,
}

/// Drives a [`MessageProcessor`] over every record of a batch and collects
/// the ids of the records that failed.
pub struct BatchDispatcher<P> {
    processor: P,
    mode: DispatchMode,
    record_timeout: Option<Duration>,
}

impl<P: MessageProcessor> BatchDispatcher<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            mode: DispatchMode::default(),
            record_timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_record_timeout(mut self, timeout: Duration) -> Self {
        self.record_timeout = Some(timeout);
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    #[tracing::instrument(skip(self, ctx, batch), fields(
        request_id = %ctx.request_id,
        messaging.batch.message_count = batch.len(),
    ))]
    pub async fn dispatch(&self, ctx: &InvocationContext, batch: &Batch) -> BatchResult {
        let meter = global::meter("sqs_batch_processor");
        let processed_counter = meter.u64_counter("messages_processed").build();
        let failed_counter = meter.u64_counter("messages_failed").build();

        let outcomes = match self.mode {
            DispatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for record in batch.records() {
                    outcomes.push(self.process_record(ctx, record).await);
                }
                outcomes
            }
            DispatchMode::Concurrent => {
                let tasks = batch
                    .records()
                    .iter()
                    .map(|record| self.process_record(ctx, record));
                futures::future::join_all(tasks).await
            }
            DispatchMode::OrderedByGroup => self.dispatch_by_group(ctx, batch).await,
        };

        let result = BatchResult::from_outcomes(batch, outcomes);

        processed_counter.add((batch.len() - result.len()) as u64, &[]);
        failed_counter.add(result.len() as u64, &[]);
        tracing::info!(
            "Processed batch of {} messages, {} failed",
            batch.len(),
            result.len()
        );

        result
    }

    async fn dispatch_by_group(
        &self,
        ctx: &InvocationContext,
        batch: &Batch,
    ) -> Vec<ProcessingOutcome> {
        // Positions per group, in batch order. Ungrouped records get a lane each.
        let mut lanes: Vec<Vec<usize>> = Vec::new();
        let mut lane_by_group: HashMap<&str, usize> = HashMap::new();
        for (position, record) in batch.records().iter().enumerate() {
            match record.group_id() {
                Some(group) => {
                    let lane = *lane_by_group.entry(group).or_insert_with(|| {
                        lanes.push(Vec::new());
                        lanes.len() - 1
                    });
                    lanes[lane].push(position);
                }
                None => lanes.push(vec![position]),
            }
        }

        let records = batch.records();
        let tasks = lanes.into_iter().map(|positions| async move {
            let mut outcomes = Vec::with_capacity(positions.len());
            for position in positions {
                outcomes.push((position, self.process_record(ctx, &records[position]).await));
            }
            outcomes
        });

        let mut outcomes: Vec<Option<ProcessingOutcome>> = vec![None; batch.len()];
        for (position, outcome) in futures::future::join_all(tasks).await.into_iter().flatten() {
            outcomes[position] = Some(outcome);
        }
        outcomes.into_iter().flatten().collect()
    }

    #[tracing::instrument("process message", skip(self, ctx, record), fields(
        messaging.message.id = %record.message_id,
        messaging.operation.name = "process",
        messaging.destination = "aws_sqs",
        messaging.message.delivery_count = record.receive_count(),
    ))]
    async fn process_record(
        &self,
        ctx: &InvocationContext,
        record: &MessageRecord,
    ) -> ProcessingOutcome {
        add_span_link_from_record(&tracing::Span::current(), record);

        let work = catch_panic(self.processor.process(ctx, record));
        let result = match self.record_timeout(ctx) {
            Some(timeout) => match tokio::time::timeout(timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(ProcessingError::TimedOut(timeout).into()),
            },
            None => work.await,
        };

        let error = match result {
            Ok(()) => return ProcessingOutcome::Success,
            Err(e) => match e.downcast::<ProcessingError>() {
                Ok(processing_error) => *processing_error,
                Err(e) => ProcessingError::Failed(e.to_string()),
            },
        };
        tracing::error!("Failed to process message {}: {}", record.message_id, error);

        if matches!(
            error,
            ProcessingError::Panicked(_) | ProcessingError::TimedOut(_)
        ) {
            if let Err(e) = self.processor.abandon(ctx, record).await {
                tracing::error!("Failed to abandon message {}: {}", record.message_id, e);
            }
        }
        ProcessingOutcome::Failure(error)
    }

    /// The configured per-record timeout, capped by the time left before the
    /// invocation's deadline.
    fn record_timeout(&self, ctx: &InvocationContext) -> Option<Duration> {
        match (self.record_timeout, ctx.remaining_time()) {
            (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
            (timeout, remaining) => timeout.or(remaining),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchDispatcher, DispatchMode};
    use crate::core::{Batch, InvocationContext, MessageRecord, ProcessingOutcome};
    use crate::deduplication::tests::{in_memory_store, PanicOnce};
    use crate::deduplication::Deduplicated;
    use crate::error::ProcessingError;
    use crate::processor::tests::CapturedLogs;
    use crate::processor::{LoggingProcessor, MessageProcessor, MockMessageProcessor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    fn batch(records: &[(&str, &str)]) -> Batch {
        Batch::new(
            records
                .iter()
                .map(|(id, body)| MessageRecord::new(*id, *body))
                .collect(),
            10,
        )
        .unwrap()
    }

    fn crashing_processor() -> MockMessageProcessor {
        let mut mock_processor = MockMessageProcessor::default();
        mock_processor
            .expect_process()
            .times(3)
            .returning(|_, record| {
                if record.body == "CRASH" {
                    Err("cannot process CRASH".into())
                } else {
                    Ok(())
                }
            });
        mock_processor
    }

    /// Records the order in which bodies reach the unit of work.
    #[derive(Default)]
    struct OrderRecorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageProcessor for OrderRecorder {
        async fn process(
            &self,
            _ctx: &InvocationContext,
            record: &MessageRecord,
        ) -> Result<(), crate::error::Error> {
            // The first record of each group waits so the groups interleave.
            if record.body.ends_with("-1") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.seen.lock().unwrap().push(record.body.clone());
            Ok(())
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl MessageProcessor for PanickingProcessor {
        async fn process(
            &self,
            _ctx: &InvocationContext,
            record: &MessageRecord,
        ) -> Result<(), crate::error::Error> {
            if record.body == "CRASH" {
                panic!("unexpected body");
            }
            Ok(())
        }
    }

    struct SlowProcessor;

    #[async_trait]
    impl MessageProcessor for SlowProcessor {
        async fn process(
            &self,
            _ctx: &InvocationContext,
            record: &MessageRecord,
        ) -> Result<(), crate::error::Error> {
            if record.body == "slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    /// Outlives any record timeout on its first call and is fast afterwards.
    #[derive(Default)]
    struct SlowOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageProcessor for SlowOnce {
        async fn process(
            &self,
            _ctx: &InvocationContext,
            _record: &MessageRecord,
        ) -> Result<(), crate::error::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn when_single_message_should_succeed_and_log_body() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let dispatcher = BatchDispatcher::new(LoggingProcessor);

        let result = dispatcher
            .dispatch(
                &InvocationContext::new("request-1"),
                &batch(&[("1", "Hello from SQS!")]),
            )
            .await;

        assert!(result.is_empty());
        assert!(logs.contents().contains("Hello from SQS!"));
    }

    #[tokio::test]
    async fn when_one_record_fails_should_report_only_that_record() {
        for mode in [
            DispatchMode::Sequential,
            DispatchMode::Concurrent,
            DispatchMode::OrderedByGroup,
        ] {
            let dispatcher = BatchDispatcher::new(crashing_processor()).with_mode(mode);

            let result = dispatcher
                .dispatch(
                    &InvocationContext::default(),
                    &batch(&[("1", "A"), ("2", "CRASH"), ("3", "C")]),
                )
                .await;

            assert_eq!(result.failed_ids(), ["2".to_string()], "mode {:?}", mode);
        }
    }

    #[tokio::test]
    async fn when_one_record_fails_should_still_log_the_others() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let dispatcher = BatchDispatcher::new(Deduplicated::new(FailOnCrash, in_memory_store()))
            .with_mode(DispatchMode::Sequential);

        let result = dispatcher
            .dispatch(
                &InvocationContext::default(),
                &batch(&[("1", "A"), ("2", "CRASH"), ("3", "C")]),
            )
            .await;

        assert_eq!(result.failed_ids(), ["2".to_string()]);
        let output = logs.contents();
        assert!(output.contains("Processed message A"));
        assert!(output.contains("Processed message C"));
        assert!(!output.contains("Processed message CRASH"));
    }

    struct FailOnCrash;

    #[async_trait]
    impl MessageProcessor for FailOnCrash {
        async fn process(
            &self,
            ctx: &InvocationContext,
            record: &MessageRecord,
        ) -> Result<(), crate::error::Error> {
            if record.body == "CRASH" {
                return Err("cannot process CRASH".into());
            }
            LoggingProcessor.process(ctx, record).await
        }
    }

    #[tokio::test]
    async fn when_batch_empty_should_not_invoke_processor() {
        let mut mock_processor = MockMessageProcessor::default();
        mock_processor.expect_process().times(0);
        let dispatcher = BatchDispatcher::new(mock_processor);

        let result = dispatcher
            .dispatch(&InvocationContext::default(), &Batch::default())
            .await;

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn when_processor_panics_should_report_failure_and_continue() {
        let dispatcher = BatchDispatcher::new(PanickingProcessor);

        let result = dispatcher
            .dispatch(
                &InvocationContext::default(),
                &batch(&[("1", "A"), ("2", "CRASH"), ("3", "C")]),
            )
            .await;

        assert_eq!(result.failed_ids(), ["2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_record_times_out_should_report_failure() {
        let dispatcher = BatchDispatcher::new(SlowProcessor)
            .with_record_timeout(Duration::from_secs(1));

        let result = dispatcher
            .dispatch(
                &InvocationContext::default(),
                &batch(&[("1", "fast"), ("2", "slow")]),
            )
            .await;

        assert_eq!(result.failed_ids(), ["2".to_string()]);
    }

    #[tokio::test]
    async fn when_processor_returns_processing_error_should_keep_its_kind() {
        let mut mock_processor = MockMessageProcessor::default();
        mock_processor
            .expect_process()
            .returning(|_, record| Err(ProcessingError::InProgress(record.message_id.clone()).into()));
        let dispatcher = BatchDispatcher::new(mock_processor);

        let outcome = dispatcher
            .process_record(&InvocationContext::default(), &MessageRecord::new("7", "A"))
            .await;

        assert_eq!(
            outcome,
            ProcessingOutcome::Failure(ProcessingError::InProgress("7".to_string()))
        );
    }

    #[tokio::test]
    async fn when_ordered_by_group_should_keep_order_within_group() {
        let records = vec![
            MessageRecord::new("1", "a-1").with_attribute("MessageGroupId", "a"),
            MessageRecord::new("2", "b-1").with_attribute("MessageGroupId", "b"),
            MessageRecord::new("3", "a-2").with_attribute("MessageGroupId", "a"),
            MessageRecord::new("4", "b-2").with_attribute("MessageGroupId", "b"),
        ];
        let dispatcher =
            BatchDispatcher::new(OrderRecorder::default()).with_mode(DispatchMode::OrderedByGroup);

        let result = dispatcher
            .dispatch(
                &InvocationContext::default(),
                &Batch::new(records, 10).unwrap(),
            )
            .await;

        assert!(result.is_empty());
        let seen = dispatcher.processor().seen.lock().unwrap().clone();
        let position = |body: &str| seen.iter().position(|s| s == body).unwrap();
        assert_eq!(seen.len(), 4);
        assert!(position("a-1") < position("a-2"));
        assert!(position("b-1") < position("b-2"));
    }

    #[tokio::test]
    async fn when_sequential_should_process_in_batch_order() {
        let dispatcher =
            BatchDispatcher::new(OrderRecorder::default()).with_mode(DispatchMode::Sequential);

        dispatcher
            .dispatch(
                &InvocationContext::default(),
                &batch(&[("1", "x-1"), ("2", "x-2"), ("3", "x-3")]),
            )
            .await;

        let seen = dispatcher.processor().seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["x-1", "x-2", "x-3"]);
    }

    #[tokio::test]
    async fn when_concurrent_slow_record_should_not_delay_others() {
        let dispatcher =
            BatchDispatcher::new(OrderRecorder::default()).with_mode(DispatchMode::Concurrent);

        dispatcher
            .dispatch(
                &InvocationContext::default(),
                &batch(&[("1", "x-1"), ("2", "x-2")]),
            )
            .await;

        let seen = dispatcher.processor().seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["x-2", "x-1"]);
    }

    #[tokio::test]
    async fn when_deduplicated_processor_panics_should_allow_redelivery() {
        let dispatcher = BatchDispatcher::new(Deduplicated::new(
            PanicOnce::default(),
            in_memory_store(),
        ));
        let record = MessageRecord::new("1", "body");

        let first = dispatcher
            .process_record(&InvocationContext::new("request-1"), &record)
            .await;
        let second = dispatcher
            .process_record(&InvocationContext::new("request-2"), &record)
            .await;

        assert_eq!(
            first,
            ProcessingOutcome::Failure(ProcessingError::Panicked("transient".to_string()))
        );
        assert_eq!(second, ProcessingOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn when_deduplicated_processor_times_out_should_allow_redelivery() {
        let dispatcher = BatchDispatcher::new(Deduplicated::new(
            SlowOnce::default(),
            in_memory_store(),
        ))
        .with_record_timeout(Duration::from_secs(1));
        let record = MessageRecord::new("1", "body");

        let first = dispatcher
            .process_record(&InvocationContext::new("request-1"), &record)
            .await;
        let second = dispatcher
            .process_record(&InvocationContext::new("request-2"), &record)
            .await;

        assert_eq!(
            first,
            ProcessingOutcome::Failure(ProcessingError::TimedOut(Duration::from_secs(1)))
        );
        assert_eq!(second, ProcessingOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn when_deadline_is_near_should_time_out_before_it() {
        let dispatcher = BatchDispatcher::new(SlowProcessor)
            .with_record_timeout(Duration::from_secs(60));
        let mut ctx = InvocationContext::new("request-1");
        ctx.deadline = Some(SystemTime::now() + Duration::from_secs(2));

        let outcome = dispatcher
            .process_record(&ctx, &MessageRecord::new("1", "slow"))
            .await;

        match outcome {
            ProcessingOutcome::Failure(ProcessingError::TimedOut(timeout)) => {
                assert!(timeout <= Duration::from_secs(2));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn when_processor_panics_should_abandon_record() {
        let mut mock_processor = MockMessageProcessor::default();
        mock_processor
            .expect_process()
            .returning(|_, _| Err(ProcessingError::Panicked("boom".to_string()).into()));
        mock_processor
            .expect_abandon()
            .times(1)
            .returning(|_, record| {
                assert_eq!(record.message_id, "1");
                Ok(())
            });
        let dispatcher = BatchDispatcher::new(mock_processor);

        let outcome = dispatcher
            .process_record(&InvocationContext::default(), &MessageRecord::new("1", "A"))
            .await;

        assert_eq!(
            outcome,
            ProcessingOutcome::Failure(ProcessingError::Panicked("boom".to_string()))
        );
    }
}
