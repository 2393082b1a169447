//! Stage span helpers.
//!
//! Provides span creation for the three points where a work item touches a
//! queue (receive, ingress, send) and state-transition recording for the
//! stage life cycle.

use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

use super::carrier::{TraceCarrier, TracePropagator};
use crate::model::{Stage, StageState};

/// Start the consumer span for a received message.
///
/// If the carrier decodes, the span is a child of the sender's context.
/// Otherwise it is a new root: the hop is still traced, only disconnected
/// from upstream. The `correlation.id` field is filled once the body has
/// been decoded.
pub fn start_receive_span(
    stage: Stage,
    source: &str,
    carrier: &TraceCarrier,
    propagator: &dyn TracePropagator,
) -> Span {
    let span = tracing::info_span!(
        parent: None,
        "pipeline.receive",
        "otel.kind" = "consumer",
        "pipeline.step" = stage.number(),
        "messaging.system" = "queue",
        "messaging.operation" = "receive",
        "messaging.source" = source,
        "correlation.id" = tracing::field::Empty,
        "stage.state" = tracing::field::Empty,
    );

    match propagator.decode(carrier) {
        Some(parent) => {
            let _ = span.set_parent(parent);
        }
        None => {
            tracing::debug!(
                stage = %stage,
                operation = "trace_extract",
                "no usable trace context on message, starting new trace"
            );
        }
    }
    span
}

/// Start the span for an ingress trigger handled by stage 1.
pub fn start_ingress_span(correlation_id: &str) -> Span {
    tracing::info_span!(
        parent: None,
        "pipeline.ingress",
        "otel.kind" = "server",
        "pipeline.step" = Stage::One.number(),
        "correlation.id" = correlation_id,
        "stage.state" = tracing::field::Empty,
    )
}

/// Start the producer span for forwarding to `destination`, as a child of
/// `parent`. Its context is what gets encoded into the carrier.
pub fn start_send_span(
    parent: &Span,
    stage: Stage,
    destination: &str,
    correlation_id: &str,
) -> Span {
    tracing::info_span!(
        parent: parent,
        "pipeline.send",
        "otel.kind" = "producer",
        "pipeline.step" = stage.number(),
        "messaging.system" = "queue",
        "messaging.operation" = "send",
        "messaging.destination" = destination,
        "correlation.id" = correlation_id,
    )
}

/// Record a life-cycle transition on the span.
///
/// Emits a tracing `debug` event scoped to the span and keeps the span's
/// `stage.state` field on the latest state.
pub fn record_state_transition(span: &Span, from: StageState, to: StageState) {
    debug_assert!(
        from.can_transition_to(to),
        "illegal stage transition {from} -> {to}"
    );
    span.record("stage.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}
