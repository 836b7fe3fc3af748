// Library exports for the queue-driven lens pipeline
//
// An image goes to a detection worker, its paragraphs to a translation
// worker, and the translations are painted back over the original image.

pub mod broker;
pub mod core;
pub mod orchestration;
pub mod services;
pub mod utils;
pub mod workers;

// Re-export commonly used types and functions
pub use broker::{declare_topology, Broker, InMemoryBroker, StageTopology};

pub use core::{
    config::Config,
    errors::{BrokerError, CapabilityError, ErrorKind, PipelineError, RenderError, WorkerError},
    types::{Artifact, Detection, DetectionOutput, ParagraphBlock, Stage, TaskId},
};

pub use orchestration::PipelineOrchestrator;

pub use services::{
    CosmicTextPainter, Detector, GlyphPainter, HttpDetector, HttpTranslator, ResultCache,
    TextLayoutRenderer, Translator,
};

pub use utils::{Metrics, MetricsSnapshot};

pub use workers::{DetectionHandler, TranslationHandler, WorkerShell};
