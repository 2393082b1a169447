//! Stage engine: the per-stage receive/process/forward loop and the
//! pipeline that wires three of them together.

pub mod handler;
pub mod pipeline;
pub mod shutdown;
pub mod stage;

pub use handler::{BusinessError, SimulatedWork, StageHandler};
pub use pipeline::{Pipeline, PipelineChannels};
pub use shutdown::Shutdown;
pub use stage::{Disposition, IngressReceipt, IngressRequest, StageConfig, StageProcessor};
