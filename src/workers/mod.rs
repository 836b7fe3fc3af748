//! Worker shells: one consume loop per stage.
//!
//! A shell drains its stage's task queue one message at a time. Each task is
//! decoded, looked up in the shell's result cache, handed to the stage
//! capability on a miss, and answered on the result queue. The task is acked
//! only after its result is published; every failure rejects it into the
//! dead-letter queue.

pub mod detection;
pub mod translation;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery, StageTopology};
use crate::core::config::WorkerConfig;
use crate::core::errors::{BrokerError, BrokerResult, WorkerError, WorkerResult};
use crate::core::types::{ResultEnvelope, Stage, StageResult, Task, TaskId};
use crate::services::cache::{Fingerprint, ResultCache};
use crate::utils::Metrics;

pub use detection::DetectionHandler;
pub use translation::TranslationHandler;

/// First pause after a delivery could not be settled
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Longest pause between failed deliveries
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Stage-specific half of a worker shell
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// Task payload as it appears on the wire
    type Payload: DeserializeOwned + Send;
    /// Payload after validation, ready for fingerprinting and processing
    type Input: Send + Sync;
    /// Value published in the StageResult and kept in the cache
    type Output: Serialize + Clone + Send + Sync;

    fn stage(&self) -> Stage;

    fn prepare(&self, payload: Self::Payload) -> WorkerResult<Self::Input>;

    async fn fingerprint(&self, input: &Self::Input) -> WorkerResult<Fingerprint>;

    /// Run the stage capability
    async fn process(&self, input: &Self::Input) -> WorkerResult<Self::Output>;
}

/// What the shell does with a processed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Publish the result, then ack
    Publish,
    /// Reject without requeue
    DeadLetter,
}

/// Map a processing result to its disposition
pub fn disposition<T>(result: &WorkerResult<T>) -> Disposition {
    match result {
        Ok(_) => Disposition::Publish,
        Err(_) => Disposition::DeadLetter,
    }
}

/// Generic consume loop around a [`StageHandler`]
pub struct WorkerShell<H: StageHandler> {
    handler: H,
    broker: Arc<dyn Broker>,
    topology: StageTopology,
    cache: ResultCache<H::Output>,
    config: WorkerConfig,
    metrics: Metrics,
}

impl<H: StageHandler> WorkerShell<H> {
    pub fn new(
        handler: H,
        broker: Arc<dyn Broker>,
        topology: StageTopology,
        cache: ResultCache<H::Output>,
        config: WorkerConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            handler,
            broker,
            topology,
            cache,
            config,
            metrics,
        }
    }

    pub fn cache(&self) -> &ResultCache<H::Output> {
        &self.cache
    }

    /// Consume tasks until `shutdown` resolves or the broker closes
    pub async fn run_until<F>(mut self, shutdown: F) -> BrokerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let stage = self.handler.stage();
        let broker = Arc::clone(&self.broker);
        let queue = self.topology.tasks.clone();
        tokio::pin!(shutdown);

        info!("✓ {} worker consuming {}", stage, queue);
        let mut backoff = RETRY_BACKOFF_BASE;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("{} worker shutting down", stage);
                    return Ok(());
                }
                delivery = broker.consume(&queue) => match delivery {
                    Ok(delivery) => match self.handle_delivery(&delivery).await {
                        Ok(_) => backoff = RETRY_BACKOFF_BASE,
                        Err(e) => {
                            error!(
                                "{} worker failed to settle delivery {}: {}, pausing {:?}",
                                stage, delivery.tag, e, backoff
                            );
                            // The task was requeued; give the result queue time to recover
                            tokio::select! {
                                _ = &mut shutdown => {
                                    info!("{} worker shutting down", stage);
                                    return Ok(());
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = backoff.saturating_mul(2).min(RETRY_BACKOFF_MAX);
                        }
                    },
                    Err(BrokerError::Closed) => {
                        info!("{} worker stopping: broker closed", stage);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Process one delivery to completion and settle it
    pub async fn handle_delivery(&mut self, delivery: &Delivery) -> BrokerResult<Disposition> {
        let stage = self.handler.stage();
        let start = Instant::now();

        // The task id survives a malformed payload, which lets a failure be reported
        let task_id = serde_json::from_slice::<ResultEnvelope>(&delivery.body)
            .ok()
            .map(|envelope| envelope.task_id);

        let result = match serde_json::from_slice::<Task<H::Payload>>(&delivery.body) {
            Ok(task) => {
                let task_id = task.task_id.clone();
                self.run_task(task)
                    .await
                    .and_then(|output| encode_result(StageResult::ok(task_id, output)))
            }
            Err(e) => Err(WorkerError::Decode(e.to_string())),
        };

        let action = disposition(&result);
        match result {
            Ok(body) => {
                if let Err(e) = self.broker.publish(&self.topology.results, body).await {
                    // Not acked: the task goes back for another attempt
                    warn!("{} result publish failed, requeueing task: {}", stage, e);
                    self.broker.reject(delivery, true).await?;
                    return Err(e);
                }
                self.broker.ack(delivery).await?;
                debug!(
                    "{} task {} done in {:.0}ms",
                    stage,
                    task_id.as_ref().map(TaskId::as_str).unwrap_or("?"),
                    start.elapsed().as_millis()
                );
            }
            Err(e) => {
                warn!(
                    task_id = task_id.as_ref().map(TaskId::as_str).unwrap_or("?"),
                    "{} task dead-lettered: {}", stage, e
                );
                if self.config.report_failures {
                    self.report_failure(task_id, &e).await;
                }
                self.broker.reject(delivery, false).await?;
                self.metrics.record_dead_letter(stage);
            }
        }
        Ok(action)
    }

    async fn run_task(&mut self, task: Task<H::Payload>) -> WorkerResult<H::Output> {
        let stage = self.handler.stage();
        let input = self.handler.prepare(task.payload)?;
        let fingerprint = self.handler.fingerprint(&input).await?;

        if let Some(cached) = self.cache.lookup(&fingerprint) {
            self.metrics.record_cache_hit(stage);
            debug!("{} cache hit for task {} ({})", stage, task.task_id, fingerprint);
            return Ok(cached);
        }
        self.metrics.record_cache_miss(stage);

        let output = self.handler.process(&input).await?;
        if let Some(evicted) = self.cache.insert(fingerprint, output.clone()) {
            debug!("{} cache evicted {}", stage, evicted);
        }
        Ok(output)
    }

    /// Publish a Failed result so the waiting request fails fast
    async fn report_failure(&self, task_id: Option<TaskId>, cause: &WorkerError) {
        let Some(task_id) = task_id else {
            return;
        };
        let failed = StageResult::<H::Output>::failed(task_id, cause.to_string());
        let published = match encode_result(failed) {
            Ok(body) => self.broker.publish(&self.topology.results, body).await,
            Err(e) => {
                error!("Failed to encode failure report: {}", e);
                return;
            }
        };
        if let Err(e) = published {
            error!("Failed to publish failure report: {}", e);
        }
    }
}

fn encode_result<R: Serialize>(result: StageResult<R>) -> WorkerResult<Vec<u8>> {
    serde_json::to_vec(&result).map_err(|e| WorkerError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{declare_topology, InMemoryBroker};
    use crate::core::errors::CapabilityError;
    use crate::core::types::{StageStatus, TranslationPayload};
    use crate::services::cache::EvictionPolicy;
    use crate::services::translation::Translator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Uppercases its input, or fails on demand
    struct FakeTranslator {
        calls: AtomicUsize,
        fail: bool,
        drop_last: bool,
    }

    impl FakeTranslator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                drop_last: false,
            }
        }
    }

    #[async_trait]
    impl Translator for FakeTranslator {
        async fn translate(&self, texts: &[String]) -> Result<Vec<String>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CapabilityError::Model("out of memory".to_string()));
            }
            let mut out: Vec<String> = texts.iter().map(|t| t.to_uppercase()).collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    async fn shell(
        translator: Arc<FakeTranslator>,
        report_failures: bool,
    ) -> (Arc<InMemoryBroker>, WorkerShell<TranslationHandler>) {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = StageTopology::for_stage(Stage::Translation, Duration::from_secs(300));
        declare_topology(broker.as_ref(), &topology).await.unwrap();

        let shell = WorkerShell::new(
            TranslationHandler::new(translator),
            broker.clone(),
            topology,
            ResultCache::new(100, EvictionPolicy::InsertionOrder).unwrap(),
            WorkerConfig { report_failures },
            Metrics::new(),
        );
        (broker, shell)
    }

    fn task(id: &str, texts: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&Task {
            task_id: TaskId::from(id),
            payload: TranslationPayload {
                texts: texts.iter().map(|t| t.to_string()).collect(),
            },
        })
        .unwrap()
    }

    async fn process_next(
        broker: &InMemoryBroker,
        shell: &mut WorkerShell<TranslationHandler>,
    ) -> Disposition {
        let delivery = broker.consume("translation_tasks").await.unwrap();
        shell.handle_delivery(&delivery).await.unwrap()
    }

    #[test]
    fn test_disposition_is_pure() {
        assert_eq!(disposition::<()>(&Ok(())), Disposition::Publish);
        assert_eq!(
            disposition::<()>(&Err(WorkerError::Decode("bad".to_string()))),
            Disposition::DeadLetter
        );
    }

    #[tokio::test]
    async fn test_success_publishes_then_acks() {
        let translator = Arc::new(FakeTranslator::new());
        let (broker, mut shell) = shell(translator, false).await;

        broker.publish("translation_tasks", task("t-1", &["hello"])).await.unwrap();
        assert_eq!(process_next(&broker, &mut shell).await, Disposition::Publish);

        assert_eq!(broker.unacked("translation_tasks").unwrap(), 0);
        let result = broker.consume("translation_results").await.unwrap();
        let parsed: StageResult<Vec<String>> = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(parsed.task_id.as_str(), "t-1");
        assert_eq!(parsed.status, StageStatus::Ok);
        assert_eq!(parsed.result.unwrap(), vec!["HELLO".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_capability() {
        let translator = Arc::new(FakeTranslator::new());
        let (broker, mut shell) = shell(translator.clone(), false).await;

        broker.publish("translation_tasks", task("t-1", &["same"])).await.unwrap();
        broker.publish("translation_tasks", task("t-2", &["same"])).await.unwrap();
        process_next(&broker, &mut shell).await;
        process_next(&broker, &mut shell).await;

        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(shell.cache().len(), 1);
        assert_eq!(broker.depth("translation_results").await.unwrap(), 2);

        let snapshot = shell.metrics.snapshot();
        let counters = snapshot.stage(Stage::Translation).unwrap();
        assert_eq!((counters.cache_hits, counters.cache_misses), (1, 1));
    }

    #[tokio::test]
    async fn test_capability_failure_dead_letters() {
        let translator = Arc::new(FakeTranslator {
            fail: true,
            ..FakeTranslator::new()
        });
        let (broker, mut shell) = shell(translator, false).await;

        broker.publish("translation_tasks", task("t-1", &["hello"])).await.unwrap();
        assert_eq!(process_next(&broker, &mut shell).await, Disposition::DeadLetter);

        assert_eq!(broker.depth("translation_results").await.unwrap(), 0);
        assert_eq!(broker.depth("translation_tasks.dead_letter").await.unwrap(), 1);
        assert_eq!(shell.cache().len(), 0);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_a_contract_violation() {
        let translator = Arc::new(FakeTranslator {
            drop_last: true,
            ..FakeTranslator::new()
        });
        let (broker, mut shell) = shell(translator, false).await;

        broker
            .publish("translation_tasks", task("t-1", &["one", "two"]))
            .await
            .unwrap();
        assert_eq!(process_next(&broker, &mut shell).await, Disposition::DeadLetter);
        assert_eq!(broker.depth("translation_tasks.dead_letter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_task_dead_letters() {
        let translator = Arc::new(FakeTranslator::new());
        let (broker, mut shell) = shell(translator.clone(), true).await;

        broker
            .publish("translation_tasks", b"{not json".to_vec())
            .await
            .unwrap();
        assert_eq!(process_next(&broker, &mut shell).await, Disposition::DeadLetter);

        // No task id, so nothing can be reported
        assert_eq!(broker.depth("translation_results").await.unwrap(), 0);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_report_failures_publishes_failed_result() {
        let translator = Arc::new(FakeTranslator {
            fail: true,
            ..FakeTranslator::new()
        });
        let (broker, mut shell) = shell(translator, true).await;

        broker.publish("translation_tasks", task("t-9", &["hello"])).await.unwrap();
        process_next(&broker, &mut shell).await;

        let result = broker.consume("translation_results").await.unwrap();
        let parsed: StageResult<Vec<String>> = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(parsed.task_id.as_str(), "t-9");
        assert_eq!(parsed.status, StageStatus::Failed);
        assert!(parsed.result.is_none());
        assert!(parsed.error.unwrap().contains("out of memory"));
        assert_eq!(broker.depth("translation_tasks.dead_letter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let translator = Arc::new(FakeTranslator::new());
        let (broker, shell) = shell(translator, false).await;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(shell.run_until(async {
            let _ = stop_rx.await;
        }));

        broker.publish("translation_tasks", task("t-1", &["hi"])).await.unwrap();
        let result = broker.consume("translation_results").await.unwrap();
        assert!(!result.body.is_empty());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_backs_off_before_retrying() {
        // Result queue never declared: every publish fails and the task is requeued
        let broker = Arc::new(InMemoryBroker::new());
        let topology = StageTopology::for_stage(Stage::Translation, Duration::from_secs(300));
        broker.declare(topology.dead_letter_queue_spec()).await.unwrap();
        broker.declare(topology.task_queue_spec()).await.unwrap();

        let metrics = Metrics::new();
        let shell = WorkerShell::new(
            TranslationHandler::new(Arc::new(FakeTranslator::new())),
            broker.clone(),
            topology,
            ResultCache::new(100, EvictionPolicy::InsertionOrder).unwrap(),
            WorkerConfig::default(),
            metrics.clone(),
        );
        broker.publish("translation_tasks", task("t-1", &["hi"])).await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(shell.run_until(async {
            let _ = stop_rx.await;
        }));

        // Attempts at 0s, 0.5s, 1.5s and 3.5s; the next one is due at 7.5s
        tokio::time::sleep(Duration::from_secs(4)).await;
        let snapshot = metrics.snapshot();
        let counters = snapshot.stage(Stage::Translation).unwrap();
        assert_eq!(counters.cache_misses, 1);
        assert_eq!(counters.cache_hits, 3);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.depth("translation_tasks").await.unwrap(), 1);
        assert_eq!(broker.depth("translation_tasks.dead_letter").await.unwrap(), 0);
    }
}
