pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    BrokerError, CapabilityError, ConfigError, ErrorKind, PipelineError, RenderError, WorkerError,
};
pub use types::{
    Artifact, Detection, DetectionOutput, ParagraphBlock, RequestStage, RequestState, Stage,
    StageResult, Task, TaskId,
};
