//! Metric sink for the pipeline.
//!
//! Stages record through the [`MetricsSink`] trait so the transport-facing
//! code never reaches for a process-wide client. [`OtelMetrics`] uses the
//! OTel Meter API with the globally-registered `MeterProvider`;
//! [`RecordingMetrics`] keeps samples in memory for tests and the demo.
//!
//! Recording is fire-and-forget: nothing here returns an error.

use std::sync::Mutex;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Meter;

/// Counter: messages a stage finished processing. Labels: `stage`.
pub const MESSAGES_PROCESSED: &str = "handoff.messages.processed";
/// Histogram: local processing time of a stage. Labels: `stage`.
pub const STAGE_DURATION: &str = "handoff.stage.duration";
/// Histogram: time between the previous milestone and receipt. Labels: `stage`.
pub const HANDOFF_DURATION: &str = "handoff.handoff.duration";
/// Histogram: stage duration differenced from embedded timestamps. Labels: `stage`.
pub const CALCULATED_DURATION: &str = "handoff.stage.calculated_duration";
/// Histogram: ingress start to terminal stage.
pub const END_TO_END_DURATION: &str = "handoff.pipeline.end_to_end";
/// Counter: a stage's local processing time fell under its threshold.
/// Labels: `stage`, `threshold_ms`.
pub const LATENCY_UNDER_THRESHOLD: &str = "handoff.latency.under_threshold";
/// Counter: a stage duration differenced from embedded timestamps fell
/// under its threshold. Labels: `stage`, `threshold_ms`.
pub const CALCULATED_UNDER_THRESHOLD: &str = "handoff.stage.calculated_under_threshold";
/// Counter: end-to-end duration fell under a threshold. Labels: `threshold_ms`.
pub const END_TO_END_UNDER_THRESHOLD: &str = "handoff.pipeline.end_to_end_under_threshold";
/// Counter: errors by kind. Labels: `stage`, `kind`.
pub const ERRORS: &str = "handoff.errors";
/// Counter: items whose pipeline ended, successful or not. Labels: `result`.
pub const PIPELINE_TOTAL: &str = "handoff.pipeline.total";
/// Counter: ingress requests accepted by stage 1. Labels: `result`.
pub const INGRESS_REQUESTS: &str = "handoff.ingress.requests";
/// Counter: queue-level operations. Labels: `queue`, `operation`.
pub const QUEUE_OPERATIONS: &str = "handoff.queue.operations";

/// Error kinds used as the `kind` label on [`ERRORS`].
pub mod kind {
    pub const INHERITED: &str = "inherited";
    pub const LOCAL: &str = "local";
    pub const MALFORMED: &str = "malformed";
    pub const SERIALIZE: &str = "serialize";
    pub const SEND: &str = "send";
    pub const RECEIVE: &str = "receive";
    pub const ACK: &str = "ack";
}

/// Destination for counters and timers.
pub trait MetricsSink: Send + Sync {
    /// Monotonic increment by one.
    fn incr(&self, name: &str, tags: &[KeyValue]);

    /// One duration sample.
    fn timing(&self, name: &str, value: Duration, tags: &[KeyValue]);
}

/// Records into OTel instruments from the `"handoff"` meter.
#[derive(Debug, Default, Clone, Copy)]
pub struct OtelMetrics;

/// Returns the shared meter for handoff instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("handoff")
}

impl MetricsSink for OtelMetrics {
    fn incr(&self, name: &str, tags: &[KeyValue]) {
        meter().u64_counter(name.to_string()).build().add(1, tags);
    }

    fn timing(&self, name: &str, value: Duration, tags: &[KeyValue]) {
        meter()
            .f64_histogram(name.to_string())
            .with_unit("ms")
            .build()
            .record(value.as_secs_f64() * 1000.0, tags);
    }
}

/// One recorded sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Count { name: String, tags: Vec<KeyValue> },
    Timing { name: String, value: Duration, tags: Vec<KeyValue> },
}

impl Sample {
    pub fn name(&self) -> &str {
        match self {
            Sample::Count { name, .. } | Sample::Timing { name, .. } => name,
        }
    }

    pub fn tags(&self) -> &[KeyValue] {
        match self {
            Sample::Count { tags, .. } | Sample::Timing { tags, .. } => tags,
        }
    }

    /// Does the sample carry `key=value` among its tags?
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags()
            .iter()
            .any(|kv| kv.key.as_str() == key && kv.value.as_str() == value)
    }
}

/// In-memory sink that keeps every sample.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    samples: Mutex<Vec<Sample>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Number of increments of `name`.
    pub fn count(&self, name: &str) -> usize {
        self.samples()
            .iter()
            .filter(|s| matches!(s, Sample::Count { .. }) && s.name() == name)
            .count()
    }

    /// Number of increments of `name` carrying `key=value`.
    pub fn count_tagged(&self, name: &str, key: &str, value: &str) -> usize {
        self.samples()
            .iter()
            .filter(|s| {
                matches!(s, Sample::Count { .. }) && s.name() == name && s.has_tag(key, value)
            })
            .count()
    }

    /// All durations recorded under `name`.
    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.samples()
            .into_iter()
            .filter_map(|s| match s {
                Sample::Timing { name: n, value, .. } if n == name => Some(value),
                _ => None,
            })
            .collect()
    }

    fn push(&self, sample: Sample) {
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample),
            Err(poisoned) => poisoned.into_inner().push(sample),
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr(&self, name: &str, tags: &[KeyValue]) {
        self.push(Sample::Count {
            name: name.to_string(),
            tags: tags.to_vec(),
        });
    }

    fn timing(&self, name: &str, value: Duration, tags: &[KeyValue]) {
        self.push(Sample::Timing {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }
}
