//! Core data model.
//!
//! A work item is the single record that travels the pipeline. Each stage
//! stamps its milestone onto the item before handing it to the next queue.

pub mod stage;
pub mod work;

pub use stage::{Stage, StageState};
pub use work::{INVALID_DATA, NewWorkItem, PipelineMetadata, WorkItem};
