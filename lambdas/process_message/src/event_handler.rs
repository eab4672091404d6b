use aws_lambda_events::sqs::SqsBatchResponse;
use lambda_runtime::{tracing, Error, LambdaEvent};
use shared::{
    core::{Batch, InvocationContext},
    dispatcher::BatchDispatcher,
    processor::MessageProcessor,
};

pub(crate) struct HandlerDeps<P: MessageProcessor> {
    pub dispatcher: BatchDispatcher<P>,
    pub max_batch_size: usize,
    pub report_batch_item_failures: bool,
}

/// The payload is taken as raw JSON so that a malformed batch is rejected by
/// us, with a structured error, before any record is processed.
#[tracing::instrument(skip(deps, event))]
pub(crate) async fn function_handler<P: MessageProcessor>(
    deps: &HandlerDeps<P>,
    event: LambdaEvent<serde_json::Value>,
) -> Result<SqsBatchResponse, Error> {
    let (payload, context) = event.into_parts();
    let ctx = InvocationContext::from(&context);

    let batch = Batch::from_payload(payload, deps.max_batch_size).map_err(|e| {
        tracing::error!("Rejecting batch: {}", e);
        e
    })?;
    tracing::info!(
        "Received batch of {} messages for request {}",
        batch.len(),
        ctx.request_id
    );

    let result = deps.dispatcher.dispatch(&ctx, &batch).await;

    if deps.report_batch_item_failures {
        return Ok(result.into_sqs_batch_response());
    }

    result.into_all_or_nothing()?;
    Ok(SqsBatchResponse::default())
}
