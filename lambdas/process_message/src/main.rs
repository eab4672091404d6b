use std::sync::Arc;

use event_handler::{function_handler, HandlerDeps};
use lambda_runtime::{run, service_fn, tracing, Error};
use shared::{
    adapters::DynamoDbDeduplicationStore,
    configuration::Configuration,
    deduplication::{Deduplicated, DeduplicationStore, InMemoryDeduplicationStore},
    dispatcher::BatchDispatcher,
    processor::LoggingProcessor,
};

mod event_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let otel_guard =
        Arc::new(shared::observability::init_otel().expect("Failed to initialize telemetry"));

    let config = Configuration::load()?;
    tracing::info!("Loaded configuration: {}", config);

    let store: Arc<dyn DeduplicationStore> = match &config.deduplication_table_name {
        Some(table_name) => {
            let aws_config =
                aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Arc::new(DynamoDbDeduplicationStore::new(
                table_name.clone(),
                aws_sdk_dynamodb::Client::new(&aws_config),
                config.deduplication_lock_timeout(),
                config.deduplication_retention(),
            ))
        }
        None => Arc::new(InMemoryDeduplicationStore::new(
            config.deduplication_lock_timeout(),
            config.deduplication_retention(),
        )),
    };

    let processor = Deduplicated::new(LoggingProcessor, store);
    let mut dispatcher = BatchDispatcher::new(processor).with_mode(config.dispatch_mode);
    if let Some(timeout) = config.record_timeout() {
        dispatcher = dispatcher.with_record_timeout(timeout);
    }

    let deps = HandlerDeps {
        dispatcher,
        max_batch_size: config.max_batch_size,
        report_batch_item_failures: config.report_batch_item_failures,
    };

    run(service_fn(|event| async {
        let res = function_handler(&deps, event).await;

        otel_guard.flush();

        res
    }))
    .await
}
