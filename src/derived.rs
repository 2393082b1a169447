//! Durations derived from the milestones embedded in a work item.
//!
//! Each milestone is written by the stage that owns it, so differencing two
//! of them never mixes clocks across the read side. Timestamps are optional
//! telemetry: when either end of an interval is missing, empty or
//! unparsable, that interval is skipped and nothing else is affected.
//! Negative intervals (clock skew between hosts) are skipped the same way.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::model::{PipelineMetadata, Stage};
use crate::telemetry::metrics::{self, MetricsSink};

/// Local processing budget per stage for the latency counter.
pub fn latency_threshold(stage: Stage) -> Duration {
    match stage {
        Stage::One | Stage::Two => Duration::from_millis(50),
        Stage::Three => Duration::from_millis(60),
    }
}

/// End-to-end budgets, each feeding its own bucket counter.
pub const END_TO_END_THRESHOLDS: [Duration; 2] =
    [Duration::from_millis(300), Duration::from_secs(1)];

/// Parse a stored milestone. `None` for empty or malformed input.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<Duration> {
    (to - from).to_std().ok()
}

/// The milestone that opens `stage`'s interval: the previous stage's
/// completion, or the ingress start for stage 1.
fn opening_milestone(meta: &PipelineMetadata, stage: Stage) -> Option<DateTime<Utc>> {
    match stage.previous() {
        Some(prev) => parse_timestamp(meta.completed(prev)),
        None => parse_timestamp(meta.start_time()),
    }
}

/// `stageN_complete − stage(N−1)_complete`, or `− start_time` for stage 1.
pub fn stage_duration(meta: &PipelineMetadata, stage: Stage) -> Option<Duration> {
    let end = parse_timestamp(meta.completed(stage))?;
    between(opening_milestone(meta, stage)?, end)
}

/// Time the item spent between the previous milestone and its receipt at
/// `stage`.
pub fn handoff_latency(
    meta: &PipelineMetadata,
    stage: Stage,
    received_at: DateTime<Utc>,
) -> Option<Duration> {
    between(opening_milestone(meta, stage)?, received_at)
}

/// `now − start_time`. Only the terminal stage asks for this.
pub fn end_to_end(meta: &PipelineMetadata, now: DateTime<Utc>) -> Option<Duration> {
    between(parse_timestamp(meta.start_time())?, now)
}

/// Everything the terminal stage reports for one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedMetrics {
    pub stage_durations: Vec<(Stage, Duration)>,
    pub end_to_end: Option<Duration>,
}

impl DerivedMetrics {
    pub fn compute(meta: &PipelineMetadata, now: DateTime<Utc>) -> Self {
        Self {
            stage_durations: Stage::ALL
                .into_iter()
                .filter_map(|stage| stage_duration(meta, stage).map(|d| (stage, d)))
                .collect(),
            end_to_end: end_to_end(meta, now),
        }
    }

    /// Timers for every computed interval plus a bucket counter for each
    /// duration under its threshold. The counters are numerators only;
    /// pass/fail is decided downstream.
    pub fn emit(&self, sink: &dyn MetricsSink) {
        for (stage, duration) in &self.stage_durations {
            let tags = [KeyValue::new("stage", stage.label())];
            sink.timing(metrics::CALCULATED_DURATION, *duration, &tags);
            record_under_threshold(
                sink,
                metrics::CALCULATED_UNDER_THRESHOLD,
                *duration,
                latency_threshold(*stage),
                Some(*stage),
            );
        }

        if let Some(total) = self.end_to_end {
            sink.timing(metrics::END_TO_END_DURATION, total, &[]);
            for threshold in END_TO_END_THRESHOLDS {
                record_under_threshold(
                    sink,
                    metrics::END_TO_END_UNDER_THRESHOLD,
                    total,
                    threshold,
                    None,
                );
            }
        }
    }
}

/// Bump counter `name` if `duration` is within `threshold`. Tagged with
/// the threshold and, when given, the stage.
pub fn record_under_threshold(
    sink: &dyn MetricsSink,
    name: &str,
    duration: Duration,
    threshold: Duration,
    stage: Option<Stage>,
) {
    if duration > threshold {
        return;
    }
    let threshold_ms = KeyValue::new("threshold_ms", threshold.as_millis() as i64);
    match stage {
        Some(stage) => sink.incr(name, &[KeyValue::new("stage", stage.label()), threshold_ms]),
        None => sink.incr(name, &[threshold_ms]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkItem;
    use crate::telemetry::metrics::RecordingMetrics;
    use serde_json::json;

    fn meta(pipeline: serde_json::Value) -> PipelineMetadata {
        let item: WorkItem =
            serde_json::from_value(json!({"correlation_id": "c", "data": "", "pipeline": pipeline}))
                .unwrap();
        item.metadata().clone()
    }

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(Some(raw)).unwrap()
    }

    #[test]
    fn parses_go_and_chrono_forms() {
        assert!(parse_timestamp(Some("2025-03-01T10:00:00.12Z")).is_some());
        assert!(parse_timestamp(Some("2025-03-01T10:00:00.123456789+00:00")).is_some());
        assert!(parse_timestamp(Some("")).is_none());
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn differences_consecutive_milestones() {
        let m = meta(json!({
            "start_time": "2025-03-01T10:00:00.000Z",
            "step1_complete": "2025-03-01T10:00:00.020Z",
            "step2_complete": "2025-03-01T10:00:00.100Z",
            "step3_complete": "2025-03-01T10:00:00.140Z",
            "current_step": 3
        }));
        assert_eq!(stage_duration(&m, Stage::One), Some(Duration::from_millis(20)));
        assert_eq!(stage_duration(&m, Stage::Two), Some(Duration::from_millis(80)));
        assert_eq!(stage_duration(&m, Stage::Three), Some(Duration::from_millis(40)));
        assert_eq!(
            end_to_end(&m, at("2025-03-01T10:00:00.500Z")),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn malformed_milestone_skips_only_its_intervals() {
        let m = meta(json!({
            "start_time": "2025-03-01T10:00:00.000Z",
            "step1_complete": "not-a-time",
            "step2_complete": "2025-03-01T10:00:00.100Z",
            "current_step": 2
        }));
        let derived = DerivedMetrics::compute(&m, at("2025-03-01T10:00:01.000Z"));
        assert!(derived.stage_durations.is_empty());
        assert_eq!(derived.end_to_end, Some(Duration::from_secs(1)));
    }

    #[test]
    fn negative_interval_is_skipped() {
        let m = meta(json!({
            "start_time": "2025-03-01T10:00:01.000Z",
            "step1_complete": "2025-03-01T10:00:00.000Z",
            "current_step": 1
        }));
        assert_eq!(stage_duration(&m, Stage::One), None);
    }

    #[test]
    fn handoff_latency_uses_previous_milestone() {
        let m = meta(json!({
            "start_time": "2025-03-01T10:00:00.000Z",
            "step1_complete": "2025-03-01T10:00:00.020Z",
            "current_step": 1
        }));
        assert_eq!(
            handoff_latency(&m, Stage::Two, at("2025-03-01T10:00:00.070Z")),
            Some(Duration::from_millis(50))
        );
        assert_eq!(handoff_latency(&m, Stage::Three, Utc::now()), None);
    }

    #[test]
    fn emit_counts_durations_under_threshold() {
        let sink = RecordingMetrics::new();
        DerivedMetrics {
            stage_durations: vec![
                (Stage::One, Duration::from_millis(20)),
                (Stage::Two, Duration::from_millis(80)),
            ],
            end_to_end: Some(Duration::from_millis(500)),
        }
        .emit(&sink);

        assert_eq!(sink.timings(metrics::CALCULATED_DURATION).len(), 2);
        assert_eq!(sink.timings(metrics::END_TO_END_DURATION), vec![Duration::from_millis(500)]);
        // stage1 under 50ms, stage2 over; end-to-end under 1s but not 300ms
        let calculated = metrics::CALCULATED_UNDER_THRESHOLD;
        assert_eq!(sink.count_tagged(calculated, "stage", "stage1"), 1);
        assert_eq!(sink.count_tagged(calculated, "stage", "stage2"), 0);
        assert_eq!(sink.count(metrics::END_TO_END_UNDER_THRESHOLD), 1);
        assert_eq!(
            sink.count_tagged(metrics::END_TO_END_UNDER_THRESHOLD, "threshold_ms", "1000"),
            1
        );
        // local latency counters belong to the stage, not to derived metrics
        assert_eq!(sink.count(metrics::LATENCY_UNDER_THRESHOLD), 0);
    }
}
