// Custom error types for every layer of the pipeline
//
// Each layer owns a thiserror enum; the orchestrator folds them into a
// PipelineError whose Display stays opaque to the client while the stage and
// cause remain available to logs.

use thiserror::Error;

use crate::core::types::{Stage, TaskId};

/// Broker (queue) errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {queue} already declared with different arguments")]
    PreconditionFailed { queue: String },

    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    #[error("Broker is closed")]
    Closed,

    #[error("Publish to {queue} was not confirmed")]
    NotConfirmed { queue: String },

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Errors raised by an external model capability
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Capability request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Capability returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Invalid capability response: {0}")]
    InvalidResponse(String),

    #[error("Model error: {0}")]
    Model(String),
}

/// Worker shell errors; every variant routes the task to the dead-letter queue
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task decode failed: {0}")]
    Decode(String),

    #[error("Capability failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Worker internal error: {0}")]
    Internal(String),
}

/// Rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Contract violation: {blocks} blocks but {translations} translations")]
    ContractViolation { blocks: usize, translations: usize },

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Font loading failed: {0}")]
    FontLoad(String),
}

/// Coarse classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapabilityFailure,
    CorrelationTimeout,
    ContractViolation,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapabilityFailure => "capability failure",
            ErrorKind::CorrelationTimeout => "correlation timeout",
            ErrorKind::ContractViolation => "contract violation",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline orchestration errors
///
/// `Display` only names the kind of failure. Stage and task detail are kept
/// in the fields for logging and are not part of the client contract.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request failed: {}", ErrorKind::CorrelationTimeout)]
    CorrelationTimeout { task_id: TaskId, stage: Stage },

    #[error("request failed: {}", ErrorKind::CapabilityFailure)]
    StageFailed {
        task_id: TaskId,
        stage: Stage,
        reason: Option<String>,
    },

    #[error("request failed: {}", ErrorKind::ContractViolation)]
    ContractViolation {
        task_id: TaskId,
        stage: Option<Stage>,
        reason: String,
    },

    #[error("request failed: {}", ErrorKind::InvalidInput)]
    InvalidInput(String),

    #[error("request failed: {}", ErrorKind::Internal)]
    Broker(#[from] BrokerError),

    #[error("request failed: {}", ErrorKind::Internal)]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::CorrelationTimeout { .. } => ErrorKind::CorrelationTimeout,
            PipelineError::StageFailed { .. } => ErrorKind::CapabilityFailure,
            PipelineError::ContractViolation { .. } => ErrorKind::ContractViolation,
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::Broker(_) | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stage the failure happened in, when known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::CorrelationTimeout { stage, .. }
            | PipelineError::StageFailed { stage, .. } => Some(*stage),
            PipelineError::ContractViolation { stage, .. } => *stage,
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("Cache capacity must be > 0")]
    InvalidCacheCapacity,

    #[error("Invalid orchestrator config: {0}")]
    InvalidOrchestratorConfig(String),

    #[error("Invalid reconstruction config: {0}")]
    InvalidReconstructionConfig(String),

    #[error("Invalid rendering config: {0}")]
    InvalidRenderingConfig(String),

    #[error("Invalid broker config: {0}")]
    InvalidBrokerConfig(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

pub type BrokerResult<T> = Result<T, BrokerError>;
pub type CapabilityResult<T> = Result<T, CapabilityError>;
pub type WorkerResult<T> = Result<T, WorkerError>;
pub type RenderResult<T> = Result<T, RenderError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_display_hides_stage() {
        let err = PipelineError::CorrelationTimeout {
            task_id: TaskId::from("abc"),
            stage: Stage::Translation,
        };
        let shown = err.to_string();
        assert_eq!(shown, "request failed: correlation timeout");
        assert!(!shown.contains("translation"));
        assert_eq!(err.stage(), Some(Stage::Translation));
        assert_eq!(err.kind(), ErrorKind::CorrelationTimeout);
    }

    #[test]
    fn test_broker_error_is_internal() {
        let err: PipelineError = BrokerError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.stage(), None);
    }
}
