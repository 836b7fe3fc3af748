// Pipeline orchestrator: request -> detection -> translation -> compose
//
// Every request runs on its caller's task. Waiting for a stage result is a
// timeout over a oneshot receiver fed by that stage's result demultiplexer,
// so requests never block each other.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use super::correlation::{CorrelationRegistry, ResultDemux};
use crate::broker::{Broker, StageTopology};
use crate::core::config::{Config, OrchestratorConfig};
use crate::core::errors::{PipelineError, PipelineResult, RenderError};
use crate::core::types::{
    Artifact, DetectionOutput, DetectionPayload, RequestStage, RequestState, Stage, StageResult,
    StageStatus, Task, TaskId, TranslationPayload,
};
use crate::services::rendering::TextLayoutRenderer;
use crate::utils::{encode_base64, encode_image_async, load_image_from_memory_async, Metrics};

const STAGES: [Stage; 2] = [Stage::Detection, Stage::Translation];

/// Drives client requests through the two queue-backed stages
pub struct PipelineOrchestrator {
    broker: Arc<dyn Broker>,
    config: OrchestratorConfig,
    renderer: TextLayoutRenderer,
    metrics: Metrics,
    // Indexed by Stage::index
    topologies: [StageTopology; 2],
    registries: [Arc<CorrelationRegistry>; 2],
    requests: DashMap<TaskId, RequestState>,
    demuxers: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes a request's state and pending waiters on every exit path,
/// including the caller dropping the `submit` future
struct RequestGuard<'a> {
    orchestrator: &'a PipelineOrchestrator,
    task_id: TaskId,
}

impl<'a> RequestGuard<'a> {
    fn new(orchestrator: &'a PipelineOrchestrator, task_id: TaskId) -> Self {
        orchestrator
            .requests
            .insert(task_id.clone(), RequestState::new(task_id.clone()));
        Self {
            orchestrator,
            task_id,
        }
    }

    fn update(&self, f: impl FnOnce(&mut RequestState)) {
        if let Some(mut state) = self.orchestrator.requests.get_mut(&self.task_id) {
            f(&mut state);
        }
    }

    fn set_stage(&self, stage: RequestStage) {
        self.update(|state| state.stage = stage);
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        for registry in &self.orchestrator.registries {
            registry.remove(&self.task_id);
        }
        self.orchestrator.requests.remove(&self.task_id);
    }
}

impl PipelineOrchestrator {
    /// Create the orchestrator and spawn one result demultiplexer per stage.
    ///
    /// The stage topology must already be declared on `broker`.
    pub fn start(
        broker: Arc<dyn Broker>,
        config: &Config,
        renderer: TextLayoutRenderer,
        metrics: Metrics,
    ) -> Arc<Self> {
        let ttl = config.broker.message_ttl;
        let topologies = STAGES.map(|stage| {
            StageTopology::for_stage(stage, ttl)
                .with_dead_letter_limit(config.broker.dead_letter_limit)
        });
        let registries = STAGES.map(|stage| Arc::new(CorrelationRegistry::new(stage)));

        let demuxers = topologies
            .iter()
            .zip(&registries)
            .map(|(topology, registry)| {
                ResultDemux::spawn(
                    Arc::clone(&broker),
                    Arc::clone(registry),
                    topology.results.clone(),
                    metrics.clone(),
                )
            })
            .collect();

        info!(
            "✓ Orchestrator ready (stage budget {:?}, output {:?})",
            config.orchestrator.stage_budget(),
            config.orchestrator.output_format
        );

        Arc::new(Self {
            broker,
            config: config.orchestrator.clone(),
            renderer,
            metrics,
            topologies,
            registries,
            requests: DashMap::new(),
            demuxers: Mutex::new(demuxers),
        })
    }

    /// Requests currently being processed
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Stage results still awaited, across both stages
    pub fn pending_results(&self) -> usize {
        self.registries.iter().map(|registry| registry.len()).sum()
    }

    /// True while every stage's result queue is being consumed
    pub fn is_healthy(&self) -> bool {
        self.registries.iter().all(|registry| registry.is_consuming())
    }

    pub fn request_state(&self, task_id: &TaskId) -> Option<RequestState> {
        self.requests.get(task_id).map(|state| state.clone())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop the result demultiplexers
    pub fn shutdown(&self) {
        for handle in self.demuxers.lock().drain(..) {
            handle.abort();
        }
    }

    /// Run one image through detection, translation and composition
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn submit(&self, image_bytes: Vec<u8>) -> PipelineResult<Artifact> {
        let start = Instant::now();
        self.metrics.record_request_started();

        let result = self.run(image_bytes).await;

        self.metrics.record_request_finished(result.is_ok(), start.elapsed());
        match &result {
            Ok(artifact) => info!(
                task_id = %artifact.task_id,
                "✓ Request done: {} blocks in {}ms",
                artifact.blocks_rendered,
                start.elapsed().as_millis()
            ),
            Err(e) => warn!(
                stage = e.stage().map(|s| s.as_str()).unwrap_or("-"),
                "Request failed after {}ms: {:?}",
                start.elapsed().as_millis(),
                e
            ),
        }
        result
    }

    async fn run(&self, image_bytes: Vec<u8>) -> PipelineResult<Artifact> {
        // Reject undecodable input before anything is published
        let encoded = encode_base64(&image_bytes);
        let image = load_image_from_memory_async(image_bytes)
            .await
            .map_err(|e| PipelineError::InvalidInput(format!("{:#}", e)))?;

        let task_id = TaskId::generate();
        let guard = RequestGuard::new(self, task_id.clone());

        let result = self.drive(&guard, image, encoded).await;
        if result.is_err() {
            guard.set_stage(RequestStage::Failed);
        }
        result
    }

    async fn drive(
        &self,
        guard: &RequestGuard<'_>,
        image: image::DynamicImage,
        encoded: String,
    ) -> PipelineResult<Artifact> {
        let task_id = guard.task_id.clone();

        let detection: DetectionOutput = self
            .dispatch(guard, Stage::Detection, DetectionPayload { image: encoded })
            .await?;
        guard.update(|state| state.partial = Some(detection.clone()));

        let translations: Vec<String> = if detection.blocks.is_empty() {
            debug!(task_id = %task_id, "No text detected, skipping translation");
            Vec::new()
        } else {
            let texts = detection.blocks.iter().map(|b| b.text.clone()).collect();
            self.dispatch(guard, Stage::Translation, TranslationPayload { texts })
                .await?
        };

        guard.update(|state| {
            state.stage = RequestStage::Composing;
            state.deadline = None;
        });

        let renderer = self.renderer.clone();
        let blocks = detection.blocks;
        let median_height = detection.median_height;
        let composed = tokio::task::spawn_blocking(move || {
            renderer.compose(image.to_rgba8(), &blocks, &translations, median_height)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("compose task failed: {}", e)))?
        .map_err(|e| match e {
            RenderError::ContractViolation { .. } => PipelineError::ContractViolation {
                task_id: task_id.clone(),
                stage: None,
                reason: e.to_string(),
            },
            other => PipelineError::Internal(other.to_string()),
        })?;

        let (width, height) = composed.image.dimensions();
        let blocks_rendered = composed.placements.len();
        let format = self.config.output_format;
        let bytes = encode_image_async(composed.image, format)
            .await
            .map_err(|e| PipelineError::Internal(format!("{:#}", e)))?;

        guard.set_stage(RequestStage::Done);
        Ok(Artifact {
            task_id,
            bytes,
            format,
            width,
            height,
            blocks_rendered,
        })
    }

    /// Publish one stage task and wait for its correlated result
    async fn dispatch<P, R>(&self, guard: &RequestGuard<'_>, stage: Stage, payload: P) -> PipelineResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let task_id = guard.task_id.clone();
        let topology = &self.topologies[stage.index()];
        let budget = self.config.stage_budget();

        let body = serde_json::to_vec(&Task {
            task_id: task_id.clone(),
            payload,
        })
        .map_err(|e| PipelineError::Internal(format!("task encode failed: {}", e)))?;

        // Register before publishing so a fast result cannot be missed
        let receiver: oneshot::Receiver<Vec<u8>> =
            self.registries[stage.index()].register(task_id.clone());

        let started = Instant::now();
        guard.update(|state| {
            state.stage = match stage {
                Stage::Detection => RequestStage::AwaitingDetection,
                Stage::Translation => RequestStage::AwaitingTranslation,
            };
            state.deadline = Some(started + budget);
        });

        self.broker.publish(&topology.tasks, body).await?;
        self.metrics.record_dispatch(stage);
        debug!(task_id = %task_id, "Dispatched {} task to {}", stage, topology.tasks);

        let raw = match timeout(budget, receiver).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => {
                return Err(PipelineError::Internal(format!(
                    "{} result channel closed",
                    stage
                )))
            }
            Err(_) => {
                self.metrics.record_timeout(stage);
                warn!(task_id = %task_id, "No {} result within {:?}", stage, budget);
                return Err(PipelineError::CorrelationTimeout { task_id, stage });
            }
        };

        let result: StageResult<R> =
            serde_json::from_slice(&raw).map_err(|e| PipelineError::ContractViolation {
                task_id: task_id.clone(),
                stage: Some(stage),
                reason: format!("malformed result: {}", e),
            })?;

        match (result.status, result.result) {
            (StageStatus::Ok, Some(value)) => {
                self.metrics.record_stage_completed(stage, started.elapsed());
                Ok(value)
            }
            (StageStatus::Ok, None) => Err(PipelineError::ContractViolation {
                task_id,
                stage: Some(stage),
                reason: "result missing".to_string(),
            }),
            (StageStatus::Failed, _) => {
                self.metrics.record_stage_failed(stage);
                Err(PipelineError::StageFailed {
                    task_id,
                    stage,
                    reason: result.error,
                })
            }
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
