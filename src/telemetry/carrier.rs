//! Trace-context carrier for queue hops.
//!
//! The queue transport has no notion of tracing, so the sending stage
//! flattens its active span context into string key/values that ride along
//! as message attributes, and the receiving stage rebuilds a parent context
//! from them. Both directions degrade instead of failing: an unusable
//! context on send yields an empty carrier, an unusable carrier on receive
//! yields `None` and the caller starts a fresh root span.

use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

/// Flat string mapping carrying a serialized trace context.
pub type TraceCarrier = HashMap<String, String>;

/// Attribute key holding the redundant copy of the correlation id.
pub const CORRELATION_ID_ATTRIBUTE: &str = "correlation-id";

/// Narrow encode/decode seam between the stages and the tracing backend.
pub trait TracePropagator: Send + Sync {
    /// Serialize the context of `span`. Never fails; an empty carrier
    /// means the handoff proceeds untraced.
    fn encode(&self, span: &Span) -> TraceCarrier;

    /// Rebuild a remote parent context. `None` when the carrier is empty,
    /// incomplete or corrupted. Pure: repeated calls on the same carrier
    /// return equivalent contexts.
    fn decode(&self, carrier: &TraceCarrier) -> Option<Context>;
}

/// W3C Trace Context (`traceparent` / `tracestate`) propagation.
#[derive(Debug, Default)]
pub struct W3cPropagator {
    inner: TraceContextPropagator,
}

impl W3cPropagator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TracePropagator for W3cPropagator {
    fn encode(&self, span: &Span) -> TraceCarrier {
        let cx = span.context();
        let mut carrier = TraceCarrier::new();
        if !cx.span().span_context().is_valid() {
            tracing::debug!(
                operation = "trace_inject",
                "no active trace context, forwarding untraced"
            );
            return carrier;
        }
        self.inner.inject_context(&cx, &mut carrier);
        carrier
    }

    fn decode(&self, carrier: &TraceCarrier) -> Option<Context> {
        if carrier.is_empty() {
            return None;
        }
        let cx = self.inner.extract(carrier);
        cx.span().span_context().is_valid().then_some(cx)
    }
}

/// Propagator that carries nothing. Every hop starts a new trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn encode(&self, _span: &Span) -> TraceCarrier {
        TraceCarrier::new()
    }

    fn decode(&self, _carrier: &TraceCarrier) -> Option<Context> {
        None
    }
}

/// Merge a carrier and the correlation id into message attributes.
pub fn attach_correlation_id(mut carrier: TraceCarrier, correlation_id: &str) -> TraceCarrier {
    carrier.insert(
        CORRELATION_ID_ATTRIBUTE.to_string(),
        correlation_id.to_string(),
    );
    carrier
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt as _;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn carrier(pairs: &[(&str, &str)]) -> TraceCarrier {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decode_valid_traceparent() {
        let cx = W3cPropagator::new()
            .decode(&carrier(&[("traceparent", TRACEPARENT)]))
            .expect("valid carrier decodes");
        assert_eq!(
            cx.span().span_context().trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert!(cx.span().span_context().is_remote());
    }

    #[test]
    fn decode_is_idempotent() {
        let propagator = W3cPropagator::new();
        let input = carrier(&[("traceparent", TRACEPARENT), ("correlation-id", "abc")]);
        let a = propagator.decode(&input).unwrap();
        let b = propagator.decode(&input).unwrap();
        assert_eq!(a.span().span_context(), b.span().span_context());
        assert_eq!(input.len(), 2);
    }

    #[test]
    fn decode_degrades_on_bad_carriers() {
        let propagator = W3cPropagator::new();
        assert!(propagator.decode(&TraceCarrier::new()).is_none());
        assert!(
            propagator
                .decode(&carrier(&[("correlation-id", "abc")]))
                .is_none()
        );
        assert!(
            propagator
                .decode(&carrier(&[("traceparent", "00-garbage")]))
                .is_none()
        );
        assert!(
            propagator
                .decode(&carrier(&[(
                    "traceparent",
                    "00-00000000000000000000000000000000-0000000000000000-01"
                )]))
                .is_none()
        );
    }

    #[test]
    fn encode_without_otel_layer_is_empty() {
        let span = tracing::info_span!("send");
        assert!(W3cPropagator::new().encode(&span).is_empty());
    }

    #[test]
    fn encode_then_decode_keeps_trace_id() {
        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("handoff-test");
        let subscriber =
            tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));

        tracing::subscriber::with_default(subscriber, || {
            let propagator = W3cPropagator::new();
            let span = tracing::info_span!("send");
            let encoded = propagator.encode(&span);
            assert!(encoded.contains_key("traceparent"));

            let decoded = propagator.decode(&encoded).expect("round trip");
            assert_eq!(
                decoded.span().span_context().trace_id(),
                span.context().span().span_context().trace_id()
            );
        });
    }

    #[test]
    fn correlation_id_rides_alongside() {
        let attrs = attach_correlation_id(carrier(&[("traceparent", TRACEPARENT)]), "abc");
        assert_eq!(attrs.get(CORRELATION_ID_ATTRIBUTE).map(String::as_str), Some("abc"));
        assert!(attrs.contains_key("traceparent"));
    }
}
