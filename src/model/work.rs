//! The work item and its accumulated pipeline metadata.
//!
//! Fields are private so the write-once rules hold everywhere: the
//! correlation id is immutable once set, `start_time` and every
//! `stageN_complete` milestone are written at most once, `current_step`
//! never decreases and a recorded `error_type` is never cleared.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;

/// Error tag set when ingress is asked to inject a failure.
pub const INVALID_DATA: &str = "invalid_data";

/// A unit of work moving through the three stages.
///
/// The serialized form is the queue message body. Field names on the wire
/// (`data`, `pipeline`, `stepN_complete`) are kept compatible with the
/// services that already produce these messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default)]
    correlation_id: String,

    /// Opaque business data. Stages may mark it; the pipeline never reads it.
    #[serde(rename = "data", default)]
    payload: String,

    #[serde(rename = "pipeline", default)]
    metadata: PipelineMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_type: Option<String>,

    /// Stage that recorded `error_type`. Older producers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_stage: Option<Stage>,
}

/// Process milestones, one timestamp per stage plus the ingress start.
///
/// Timestamps are kept as the raw RFC 3339 strings from the wire. They are
/// telemetry, not control data: an empty or unparsable value is treated as
/// missing by readers and never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step1_complete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step2_complete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step3_complete: Option<String>,
    #[serde(default)]
    current_step: u8,
}

/// Format a timestamp the way milestones are stored.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl PipelineMetadata {
    pub fn start_time(&self) -> Option<&str> {
        non_empty(&self.start_time)
    }

    /// The completion milestone of `stage`, if that stage has run.
    pub fn completed(&self, stage: Stage) -> Option<&str> {
        non_empty(self.milestone(stage))
    }

    pub fn current_step(&self) -> u8 {
        self.current_step
    }

    fn milestone(&self, stage: Stage) -> &Option<String> {
        match stage {
            Stage::One => &self.step1_complete,
            Stage::Two => &self.step2_complete,
            Stage::Three => &self.step3_complete,
        }
    }

    fn milestone_mut(&mut self, stage: Stage) -> &mut Option<String> {
        match stage {
            Stage::One => &mut self.step1_complete,
            Stage::Two => &mut self.step2_complete,
            Stage::Three => &mut self.step3_complete,
        }
    }
}

impl WorkItem {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<String>) {
        self.payload = payload.into();
    }

    pub fn metadata(&self) -> &PipelineMetadata {
        &self.metadata
    }

    pub fn error_type(&self) -> Option<&str> {
        non_empty(&self.error_type)
    }

    /// The single short-circuit signal for every later stage.
    pub fn has_error(&self) -> bool {
        self.error_type().is_some()
    }

    /// Where the recorded error came from. Falls back to the last stage
    /// that completed when the producer did not say.
    pub fn error_origin(&self) -> Option<Stage> {
        if !self.has_error() {
            return None;
        }
        self.error_stage
            .or_else(|| Stage::from_number(self.metadata.current_step))
    }

    /// Assign a fresh correlation id if the item arrived without one.
    /// Returns `true` if an id was generated.
    pub fn ensure_correlation_id(&mut self) -> bool {
        if self.correlation_id.is_empty() {
            self.correlation_id = Uuid::new_v4().to_string();
            true
        } else {
            false
        }
    }

    /// Record the ingress start time. No-op if already set.
    pub fn mark_started(&mut self, at: DateTime<Utc>) -> bool {
        if self.metadata.start_time().is_some() {
            return false;
        }
        self.metadata.start_time = Some(format_timestamp(at));
        true
    }

    /// Stamp `stage` as complete and advance `current_step`.
    ///
    /// An existing milestone is left untouched (redelivery of an item that
    /// a previous run already stamped). Returns `true` if the milestone was
    /// written by this call.
    pub fn complete_stage(&mut self, stage: Stage, at: DateTime<Utc>) -> bool {
        self.metadata.current_step = self.metadata.current_step.max(stage.number());
        if self.metadata.completed(stage).is_some() {
            return false;
        }
        *self.metadata.milestone_mut(stage) = Some(format_timestamp(at));
        true
    }

    /// Tag the item as failed at `stage`. An error already recorded by an
    /// earlier stage wins and is kept.
    pub fn mark_error(&mut self, error_type: impl Into<String>, stage: Stage) -> bool {
        if self.has_error() {
            return false;
        }
        self.error_type = Some(error_type.into());
        self.error_stage = Some(stage);
        true
    }
}

/// Builder for the item an external trigger hands to stage 1.
///
/// Milestones are not settable here: `start_time` belongs to stage 1.
#[derive(Debug, Clone, Default)]
pub struct NewWorkItem {
    pub(crate) correlation_id: Option<String>,
    pub(crate) payload: String,
    pub(crate) error_type: Option<String>,
}

impl NewWorkItem {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            payload: payload.into(),
            error_type: None,
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.correlation_id = (!id.is_empty()).then_some(id);
        self
    }

    /// Pre-tag the item with an error, as an upstream producer would.
    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Materialize the item, generating a correlation id if none was given.
    pub fn build(self) -> WorkItem {
        WorkItem {
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload: self.payload,
            metadata: PipelineMetadata::default(),
            error_type: self.error_type,
            error_stage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn milestones_are_written_once() {
        let mut item = NewWorkItem::new("x").build();
        let t0 = Utc::now();
        assert!(item.complete_stage(Stage::One, t0));
        let first = item.metadata().completed(Stage::One).map(str::to_string);

        assert!(!item.complete_stage(Stage::One, t0 + TimeDelta::seconds(5)));
        assert_eq!(item.metadata().completed(Stage::One).map(str::to_string), first);
    }

    #[test]
    fn current_step_never_decreases() {
        let mut item = NewWorkItem::new("x").build();
        item.complete_stage(Stage::Two, Utc::now());
        item.complete_stage(Stage::One, Utc::now());
        assert_eq!(item.metadata().current_step(), 2);
    }

    #[test]
    fn first_error_wins() {
        let mut item = NewWorkItem::new("x").build();
        assert!(item.mark_error(INVALID_DATA, Stage::One));
        assert!(!item.mark_error("timeout", Stage::Two));
        assert_eq!(item.error_type(), Some(INVALID_DATA));
        assert_eq!(item.error_origin(), Some(Stage::One));
    }

    #[test]
    fn decodes_legacy_wire_format() {
        let body = r#"{
            "correlation_id": "abc",
            "data": "Initial data",
            "pipeline": {"start_time": "2025-01-01T00:00:00Z", "step1_complete": "", "current_step": 1},
            "error_type": "invalid_data"
        }"#;
        let item: WorkItem = serde_json::from_str(body).unwrap();
        assert_eq!(item.correlation_id(), "abc");
        assert_eq!(item.metadata().completed(Stage::One), None);
        assert_eq!(item.error_origin(), Some(Stage::One));
    }

    #[test]
    fn empty_correlation_id_is_generated() {
        let mut item: WorkItem = serde_json::from_str(r#"{"data": "x"}"#).unwrap();
        assert!(item.ensure_correlation_id());
        assert!(!item.correlation_id().is_empty());
        assert!(!item.ensure_correlation_id());
    }
}
