//! Pipeline positions and the per-message life cycle of a stage processor.

use serde::{Deserialize, Serialize};

/// Position of a stage processor in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    One,
    Two,
    Three,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::One, Stage::Two, Stage::Three];

    pub fn number(self) -> u8 {
        match self {
            Stage::One => 1,
            Stage::Two => 2,
            Stage::Three => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Stage::One),
            2 => Some(Stage::Two),
            3 => Some(Stage::Three),
            _ => None,
        }
    }

    /// The stage whose milestone precedes this one. `None` for stage 1,
    /// whose predecessor is the ingress `start_time`.
    pub fn previous(self) -> Option<Self> {
        match self {
            Stage::One => None,
            Stage::Two => Some(Stage::One),
            Stage::Three => Some(Stage::Two),
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Stage::One => Some(Stage::Two),
            Stage::Two => Some(Stage::Three),
            Stage::Three => None,
        }
    }

    /// The final stage terminates the pipeline instead of forwarding.
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Short label used in logs and metric attributes ("stage1").
    pub fn label(self) -> &'static str {
        match self {
            Stage::One => "stage1",
            Stage::Two => "stage2",
            Stage::Three => "stage3",
        }
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.number()
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Stage::from_number(n).ok_or_else(|| format!("no pipeline stage {n}"))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("stage").unwrap_or(s);
        digits
            .parse::<u8>()
            .map_err(|_| format!("invalid stage: {s}"))
            .and_then(Stage::try_from)
    }
}

/// Life-cycle state of a stage processor while it owns one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    Receiving,
    Evaluating,
    Processing,
    ShortCircuiting,
    Forwarding,
    Terminating,
}

impl StageState {
    /// Can the processor move from self to `to`?
    pub fn can_transition_to(self, to: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, to),
            (Receiving, Evaluating)
                | (Receiving, Receiving)        // nothing received, or malformed and dropped
                | (Evaluating, Processing)
                | (Evaluating, ShortCircuiting)
                | (Processing, Forwarding)
                | (Processing, Terminating)
                | (ShortCircuiting, Receiving)
                | (Forwarding, Receiving)
                | (Terminating, Receiving)
        )
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Receiving => "receiving",
            StageState::Evaluating => "evaluating",
            StageState::Processing => "processing",
            StageState::ShortCircuiting => "short_circuiting",
            StageState::Forwarding => "forwarding",
            StageState::Terminating => "terminating",
        };
        write!(f, "{s}")
    }
}
