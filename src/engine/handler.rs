//! The stage-local business step.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StageProfile;
use crate::model::{Stage, WorkItem};

/// A business-level failure. The stage records `error_type` on the item
/// and every later stage short-circuits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct BusinessError {
    pub error_type: String,
    pub message: String,
}

impl BusinessError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Work a stage performs on an item it has accepted.
///
/// Only called when the item carries no inherited error. The handler may
/// change the payload but never the milestones; the processor owns those.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, stage: Stage, item: &mut WorkItem) -> Result<(), BusinessError>;
}

/// Fixed-duration step that marks the payload.
#[derive(Debug, Clone, Default)]
pub struct SimulatedWork {
    duration: Duration,
    marker: Option<String>,
    seed: Option<String>,
}

impl SimulatedWork {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    pub fn from_profile(profile: &StageProfile) -> Self {
        Self {
            duration: Duration::from_millis(profile.work_ms),
            marker: profile.marker.clone(),
            seed: profile.seed.clone(),
        }
    }
}

#[async_trait]
impl StageHandler for SimulatedWork {
    async fn handle(&self, _stage: Stage, item: &mut WorkItem) -> Result<(), BusinessError> {
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        if item.payload().is_empty()
            && let Some(ref seed) = self.seed
        {
            item.set_payload(seed.clone());
        }
        if let Some(ref marker) = self.marker {
            let marked = format!("{marker}{}", item.payload());
            item.set_payload(marked);
        }
        Ok(())
    }
}
