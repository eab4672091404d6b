use crate::core::MessageRecord;
use opentelemetry::{
    trace::{SpanContext, TraceState},
    SpanId, TraceFlags, TraceId,
};
use tracing_opentelemetry::OpenTelemetrySpanExt;

const TRACEPARENT_ATTRIBUTE: &str = "traceparent";
const XRAY_TRACE_HEADER_ATTRIBUTE: &str = "AWSTraceHeader";

/// Links the span processing a record to the span that produced it.
///
/// Producers propagate context either as a W3C `traceparent` message
/// attribute or, when X-Ray is active on the queue, through the
/// `AWSTraceHeader` system attribute. The former wins when both are present.
pub fn add_span_link_from_record(span: &tracing::Span, record: &MessageRecord) {
    let remote_context = if let Some(trace_parent) =
        record.message_attributes.get(TRACEPARENT_ATTRIBUTE)
    {
        tracing::debug!("Extracted traceparent: {}", trace_parent);
        extract_span_context_from(trace_parent)
    } else if let Some(trace_header) = record.attributes.get(XRAY_TRACE_HEADER_ATTRIBUTE) {
        tracing::debug!("Extracted AWSTraceHeader: {}", trace_header);
        extract_span_context_from_xray(trace_header)
    } else {
        return;
    };

    match remote_context {
        Some(remote_span_context) => span.add_link(remote_span_context),
        None => tracing::warn!(
            "Failed to extract span context from message {}",
            record.message_id
        ),
    }
}

/// Parses a W3C `traceparent` value: `00-<trace id>-<span id>-<flags>`.
pub fn extract_span_context_from(trace_parent: &str) -> Option<SpanContext> {
    let trace_parts: Vec<&str> = trace_parent.trim().split('-').collect();

    if trace_parts.len() < 4 {
        return None;
    }

    let trace_id = TraceId::from_hex(trace_parts[1]).ok()?;
    let span_id = SpanId::from_hex(trace_parts[2]).ok()?;
    let trace_flags = u8::from_str_radix(trace_parts[3], 16)
        .map(|flags| TraceFlags::new(flags) & TraceFlags::SAMPLED)
        .unwrap_or(TraceFlags::SAMPLED);

    valid_remote_context(trace_id, span_id, trace_flags)
}

/// Parses an X-Ray trace header:
/// `Root=1-<epoch>-<unique id>;Parent=<span id>;Sampled=<0|1>`.
pub fn extract_span_context_from_xray(trace_header: &str) -> Option<SpanContext> {
    let mut root = None;
    let mut parent = None;
    let mut sampled = false;

    for part in trace_header.split(';') {
        match part.trim().split_once('=') {
            Some(("Root", value)) => root = Some(value),
            Some(("Parent", value)) => parent = Some(value),
            Some(("Sampled", value)) => sampled = value == "1",
            _ => {}
        }
    }

    let root_parts: Vec<&str> = root?.split('-').collect();
    if root_parts.len() != 3 {
        return None;
    }

    let trace_id = TraceId::from_hex(&format!("{}{}", root_parts[1], root_parts[2])).ok()?;
    let span_id = SpanId::from_hex(parent?).ok()?;
    let trace_flags = if sampled {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };

    valid_remote_context(trace_id, span_id, trace_flags)
}

fn valid_remote_context(
    trace_id: TraceId,
    span_id: SpanId,
    trace_flags: TraceFlags,
) -> Option<SpanContext> {
    let span_context = SpanContext::new(trace_id, span_id, trace_flags, true, TraceState::NONE);
    span_context.is_valid().then_some(span_context)
}
