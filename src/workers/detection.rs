use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::StageHandler;
use crate::core::config::ReconstructionConfig;
use crate::core::errors::{WorkerError, WorkerResult};
use crate::core::types::{DetectionOutput, DetectionPayload, Stage};
use crate::services::cache::Fingerprint;
use crate::services::detection::Detector;
use crate::services::reconstruction::reconstruct_output;
use crate::utils::decode_base64;

/// Detection stage: image in, ordered paragraph blocks out.
///
/// Raw detections never leave the worker; they are reconstructed into
/// paragraphs before publishing, so the cache holds paragraphs too.
pub struct DetectionHandler {
    detector: Arc<dyn Detector>,
    reconstruction: ReconstructionConfig,
}

impl DetectionHandler {
    pub fn new(detector: Arc<dyn Detector>, reconstruction: ReconstructionConfig) -> Self {
        Self {
            detector,
            reconstruction,
        }
    }
}

#[async_trait]
impl StageHandler for DetectionHandler {
    type Payload = DetectionPayload;
    type Input = Arc<Vec<u8>>;
    type Output = DetectionOutput;

    fn stage(&self) -> Stage {
        Stage::Detection
    }

    fn prepare(&self, payload: DetectionPayload) -> WorkerResult<Arc<Vec<u8>>> {
        decode_base64(&payload.image)
            .map(Arc::new)
            .map_err(|e| WorkerError::Decode(format!("{:#}", e)))
    }

    async fn fingerprint(&self, input: &Arc<Vec<u8>>) -> WorkerResult<Fingerprint> {
        let bytes = Arc::clone(input);
        tokio::task::spawn_blocking(move || Fingerprint::of_image(&bytes))
            .await
            .map_err(|e| WorkerError::Internal(format!("fingerprint task failed: {}", e)))?
    }

    async fn process(&self, input: &Arc<Vec<u8>>) -> WorkerResult<DetectionOutput> {
        let detections = self.detector.detect(input).await?;
        let output = reconstruct_output(&detections, &self.reconstruction);
        debug!(
            "{} detections -> {} blocks (median height {:.1})",
            detections.len(),
            output.blocks.len(),
            output.median_height
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{declare_topology, Broker, InMemoryBroker, StageTopology};
    use crate::core::config::WorkerConfig;
    use crate::core::errors::CapabilityError;
    use crate::core::types::{Detection, StageResult, Task, TaskId};
    use crate::services::cache::{EvictionPolicy, ResultCache};
    use crate::utils::{encode_base64, encode_image, Metrics};
    use crate::workers::{Disposition, WorkerShell};
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Three words on one visual line
    struct OneLineDetector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for OneLineDetector {
        async fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let word = |text: &str, x0: f32, confidence: f32| Detection {
                quad: [[x0, 10.0], [x0 + 40.0, 10.0], [x0 + 40.0, 30.0], [x0, 30.0]],
                text: text.to_string(),
                confidence,
            };
            Ok(vec![
                word("world", 60.0, 0.9),
                word("Hello", 10.0, 0.95),
                word("again", 110.0, 0.8),
                word("smudge", 300.0, 0.1),
            ])
        }
    }

    fn png() -> Vec<u8> {
        let img = RgbaImage::from_fn(64, 32, |x, _| {
            if x < 32 {
                Rgba([20, 20, 20, 255])
            } else {
                Rgba([230, 230, 230, 255])
            }
        });
        encode_image(img, crate::core::types::OutputFormat::Png).unwrap()
    }

    fn task(id: &str, image: &[u8]) -> Vec<u8> {
        serde_json::to_vec(&Task {
            task_id: TaskId::from(id),
            payload: DetectionPayload {
                image: encode_base64(image),
            },
        })
        .unwrap()
    }

    async fn setup() -> (
        Arc<InMemoryBroker>,
        Arc<OneLineDetector>,
        WorkerShell<DetectionHandler>,
    ) {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = StageTopology::for_stage(Stage::Detection, Duration::from_secs(300));
        declare_topology(broker.as_ref(), &topology).await.unwrap();

        let detector = Arc::new(OneLineDetector {
            calls: AtomicUsize::new(0),
        });
        let shell = WorkerShell::new(
            DetectionHandler::new(detector.clone(), ReconstructionConfig::default()),
            broker.clone(),
            topology,
            ResultCache::new(100, EvictionPolicy::InsertionOrder).unwrap(),
            WorkerConfig::default(),
            Metrics::new(),
        );
        (broker, detector, shell)
    }

    #[tokio::test]
    async fn test_detection_publishes_paragraphs() {
        let (broker, _detector, mut shell) = setup().await;
        broker.publish("detection_tasks", task("d-1", &png())).await.unwrap();

        let delivery = broker.consume("detection_tasks").await.unwrap();
        assert_eq!(shell.handle_delivery(&delivery).await.unwrap(), Disposition::Publish);

        let result = broker.consume("detection_results").await.unwrap();
        let parsed: StageResult<DetectionOutput> = serde_json::from_slice(&result.body).unwrap();
        let output = parsed.result.unwrap();
        assert_eq!(output.blocks.len(), 1);
        assert_eq!(output.blocks[0].text, "Hello world again");
        assert_eq!(output.median_height, 20.0);
    }

    #[tokio::test]
    async fn test_same_image_hits_cache() {
        let (broker, detector, mut shell) = setup().await;
        let image = png();
        broker.publish("detection_tasks", task("d-1", &image)).await.unwrap();
        broker.publish("detection_tasks", task("d-2", &image)).await.unwrap();

        for _ in 0..2 {
            let delivery = broker.consume("detection_tasks").await.unwrap();
            shell.handle_delivery(&delivery).await.unwrap();
        }

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.depth("detection_results").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_image_dead_letters() {
        let (broker, detector, mut shell) = setup().await;
        broker
            .publish("detection_tasks", task("d-1", b"not an image"))
            .await
            .unwrap();

        let delivery = broker.consume("detection_tasks").await.unwrap();
        assert_eq!(
            shell.handle_delivery(&delivery).await.unwrap(),
            Disposition::DeadLetter
        );
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.depth("detection_tasks.dead_letter").await.unwrap(), 1);
    }
}
