//! Stage profiles: the simulated business step of each stage.
//!
//! Loaded from an optional TOML file:
//!
//! ```toml
//! [stage1]
//! work_ms = 20
//! seed = "Initial data from stage1"
//!
//! [stage2]
//! work_ms = 30
//! marker = "Processed by stage2: "
//!
//! [stage3]
//! work_ms = 40
//! ```
//!
//! A missing section keeps that stage's default.

use crate::error::{Error, Result};
use crate::model::Stage;
use serde::Deserialize;
use std::path::Path;

/// What one stage's business step does to a work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StageProfile {
    /// How long the step takes, in milliseconds.
    #[serde(default)]
    pub work_ms: u64,
    /// Prefixed to the payload to prove the stage consumed it.
    #[serde(default)]
    pub marker: Option<String>,
    /// Payload to use when the item arrives with an empty one.
    #[serde(default)]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageProfiles {
    #[serde(default = "default_stage1")]
    pub stage1: StageProfile,
    #[serde(default = "default_stage2")]
    pub stage2: StageProfile,
    #[serde(default = "default_stage3")]
    pub stage3: StageProfile,
}

fn default_stage1() -> StageProfile {
    StageProfile {
        work_ms: 20,
        marker: None,
        seed: Some("Initial data from stage1".to_string()),
    }
}

fn default_stage2() -> StageProfile {
    StageProfile {
        work_ms: 30,
        marker: Some("Processed by stage2: ".to_string()),
        seed: None,
    }
}

fn default_stage3() -> StageProfile {
    StageProfile {
        work_ms: 40,
        marker: None,
        seed: None,
    }
}

impl Default for StageProfiles {
    fn default() -> Self {
        Self {
            stage1: default_stage1(),
            stage2: default_stage2(),
            stage3: default_stage3(),
        }
    }
}

impl StageProfiles {
    /// Read profiles from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read stage profiles {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad stage profiles {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The same profile for every stage, with no payload changes. Handy
    /// for tests that only care about timing.
    pub fn uniform(work_ms: u64) -> Self {
        let profile = StageProfile {
            work_ms,
            ..StageProfile::default()
        };
        Self {
            stage1: profile.clone(),
            stage2: profile.clone(),
            stage3: profile,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &StageProfile {
        match stage {
            Stage::One => &self.stage1,
            Stage::Two => &self.stage2,
            Stage::Three => &self.stage3,
        }
    }
}
