pub mod correlation;
pub mod orchestrator;

pub use correlation::{CorrelationRegistry, ResultDemux};
pub use orchestrator::PipelineOrchestrator;
