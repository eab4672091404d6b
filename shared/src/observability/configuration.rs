use anyhow::Result;

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_appender_tracing::layer;
use opentelemetry_aws::detector::LambdaResourceDetector;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter};
use opentelemetry_resource_detectors::{OsResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    logs::SdkLoggerProvider,
    metrics::SdkMeterProvider,
    propagation::TraceContextPropagator,
    resource::{
        EnvResourceDetector, ResourceDetector, SdkProvidedResourceDetector,
        TelemetryResourceDetector,
    },
    trace::{RandomIdGenerator, SdkTracerProvider},
    Resource,
};
use tracing::Level;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_SERVICE_NAME: &str = "sqs-batch-processor";

// Every provider describes the same process: the Lambda function, its host
// and the SDK. OTEL_SERVICE_NAME wins over the default name.
fn resource() -> Resource {
    let detectors: Vec<Box<dyn ResourceDetector>> = vec![
        Box::new(OsResourceDetector),
        Box::new(ProcessResourceDetector),
        Box::new(SdkProvidedResourceDetector),
        Box::new(TelemetryResourceDetector),
        Box::new(LambdaResourceDetector {}),
        Box::new(EnvResourceDetector::new()),
    ];

    Resource::builder()
        .with_service_name(
            std::env::var("OTEL_SERVICE_NAME").unwrap_or(DEFAULT_SERVICE_NAME.to_string()),
        )
        .with_detectors(&detectors)
        .build()
}

// Spans for each invocation and each processed record.
fn init_tracer(resource: Resource) -> Result<SdkTracerProvider> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = SpanExporter::builder().with_tonic().build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_id_generator(RandomIdGenerator::default())
        .with_batch_exporter(exporter)
        .build())
}

// Backs the messages_processed / messages_failed counters.
fn init_meter_provider(resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder().with_tonic().build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}

// Bridges `tracing` events, including the per-message acknowledgement lines,
// to OTLP logs.
fn init_logger_provider(resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder().with_tonic().build()?;

    Ok(SdkLoggerProvider::builder()
        .with_resource(resource)
        .with_simple_exporter(exporter)
        .build())
}

pub fn init_otel() -> Result<OtelGuard> {
    let resource = resource();
    let logger = init_logger_provider(resource.clone())?;
    let trace_provider = init_tracer(resource.clone())?;
    let meter = init_meter_provider(resource)?;

    let tracer = trace_provider.tracer("sqs-batch-processor");

    let filter_otel = EnvFilter::new("info")
        .add_directive("hyper=off".parse()?)
        .add_directive("opentelemetry=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("aws_smithy_runtime=off".parse()?);
    let otel_layer = layer::OpenTelemetryTracingBridge::new(&logger).with_filter(filter_otel);

    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            Level::INFO,
        ))
        .with(otel_layer)
        .with(MetricsLayer::new(meter.clone()))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;

    Ok(OtelGuard {
        tracer_provider: trace_provider,
        meter_provider: meter,
        logger_provider: logger,
    })
}

/// Owns the providers. Flush after every invocation: the execution
/// environment may be frozen as soon as the handler returns.
pub struct OtelGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: SdkLoggerProvider,
}

impl OtelGuard {
    pub fn flush(&self) {
        if let Err(err) = self.tracer_provider.force_flush() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.meter_provider.force_flush() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.logger_provider.force_flush() {
            eprintln!("{err:?}");
        }
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("{err:?}");
        }
    }
}
