//! Conversion between `tracing` spans and envelope trace metadata.
//!
//! Producers embed the OpenTelemetry context of their publish span in the
//! envelope; consumers turn it back into a remote parent for the consume span.

use std::collections::HashMap;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde::Deserialize;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::envelope::{B3Context, TraceInfo};

/// W3C trace context header name.
const TRACEPARENT: &str = "traceparent";

/// Representation used when embedding trace context in outgoing envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceFormat {
    /// Structured B3 identifiers.
    #[default]
    B3,
    /// Opaque W3C `traceparent` string.
    TraceContext,
}

fn span_context_of(span: &tracing::Span) -> (opentelemetry::Context, SpanContext) {
    let cx = span.context();
    let span_context = cx.span().span_context().clone();
    (cx, span_context)
}

/// Build envelope trace metadata for `span`.
///
/// `parent` supplies the B3 parent span id. Returns `None` when the span has
/// no valid OpenTelemetry context (no OpenTelemetry layer installed, or a
/// disabled span).
pub fn trace_info_for(
    span: &tracing::Span,
    parent: &tracing::Span,
    format: TraceFormat,
) -> Option<TraceInfo> {
    let (cx, span_context) = span_context_of(span);
    if !span_context.is_valid() {
        return None;
    }

    match format {
        TraceFormat::B3 => {
            let (_, parent_context) = span_context_of(parent);
            let parent_span_id = if parent_context.is_valid()
                && parent_context.span_id() != span_context.span_id()
            {
                parent_context.span_id().to_string()
            } else {
                String::new()
            };

            Some(TraceInfo::B3(B3Context {
                trace_id: span_context.trace_id().to_string(),
                span_id: span_context.span_id().to_string(),
                parent_span_id,
                sampled: span_context.is_sampled(),
                debug: false,
            }))
        }
        TraceFormat::TraceContext => {
            let mut carrier: HashMap<String, String> = HashMap::new();
            TraceContextPropagator::new().inject_context(&cx, &mut carrier);
            carrier.remove(TRACEPARENT).map(TraceInfo::Propagation)
        }
    }
}

/// Rebuild a remote OpenTelemetry parent context from envelope metadata.
///
/// Returns `None` if the identifiers do not parse into a valid span context.
pub fn parent_context(info: &TraceInfo) -> Option<opentelemetry::Context> {
    match info {
        TraceInfo::B3(b3) => {
            let trace_id = TraceId::from_hex(&b3.trace_id).ok()?;
            let span_id = SpanId::from_hex(&b3.span_id).ok()?;
            let flags = if b3.sampled || b3.debug {
                TraceFlags::SAMPLED
            } else {
                TraceFlags::default()
            };
            let span_context =
                SpanContext::new(trace_id, span_id, flags, true, TraceState::default());
            if !span_context.is_valid() {
                return None;
            }
            Some(opentelemetry::Context::new().with_remote_span_context(span_context))
        }
        TraceInfo::Propagation(value) => {
            let mut carrier: HashMap<String, String> = HashMap::new();
            carrier.insert(TRACEPARENT.to_string(), value.clone());
            let cx = TraceContextPropagator::new().extract(&carrier);
            if cx.span().span_context().is_valid() {
                Some(cx)
            } else {
                None
            }
        }
    }
}

/// Create the consumer span for a delivered message, parented on the
/// producer's trace when it can be restored.
pub fn consumer_span(
    span_name: &str,
    subject: &str,
    queue: &str,
    info: &TraceInfo,
) -> tracing::Span {
    let span = tracing::info_span!(
        "bus.consume",
        otel.name = %span_name,
        otel.kind = "consumer",
        otel.status_code = tracing::field::Empty,
        subject = %subject,
        queue = %queue,
        error = tracing::field::Empty,
    );
    if let Some(cx) = parent_context(info) {
        span.set_parent(cx);
    }
    span
}

/// Mark `span` as failed with `err`.
pub fn record_error(span: &tracing::Span, err: &dyn std::fmt::Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error", tracing::field::display(err));
}
