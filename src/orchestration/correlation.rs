use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::core::errors::BrokerError;
use crate::core::types::{ResultEnvelope, Stage, TaskId};
use crate::utils::Metrics;

const CONSUME_BACKOFF_BASE: Duration = Duration::from_millis(500);
const CONSUME_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Per-stage map from task id to the waiting request's reply channel
pub struct CorrelationRegistry {
    stage: Stage,
    waiters: DashMap<TaskId, oneshot::Sender<Vec<u8>>>,
    // Cleared while the result queue cannot be consumed
    consuming: AtomicBool,
}

impl CorrelationRegistry {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            waiters: DashMap::new(),
            consuming: AtomicBool::new(true),
        }
    }

    /// False while results for this stage cannot be received
    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Relaxed)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Register a waiter. A second registration for the same id replaces the first.
    pub fn register(&self, task_id: TaskId) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(task_id, tx);
        rx
    }

    pub fn remove(&self, task_id: &TaskId) -> bool {
        self.waiters.remove(task_id).is_some()
    }

    /// Hand a raw result to its waiter.
    ///
    /// Returns false when nobody is waiting any more, making the result an
    /// orphan.
    pub fn deliver(&self, task_id: &TaskId, body: Vec<u8>) -> bool {
        match self.waiters.remove(task_id) {
            Some((_, tx)) => tx.send(body).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Consumer of one stage's result queue.
///
/// Every result is acked once it has been handed off or found orphaned, so
/// one slow request never blocks the results of others. Consume errors are
/// retried with exponential backoff until the broker closes.
pub struct ResultDemux;

impl ResultDemux {
    pub fn spawn(
        broker: Arc<dyn Broker>,
        registry: Arc<CorrelationRegistry>,
        queue: String,
        metrics: Metrics,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stage = registry.stage();
            info!("✓ {} result demultiplexer consuming {}", stage, queue);
            let mut backoff = CONSUME_BACKOFF_BASE;

            loop {
                let delivery = match broker.consume(&queue).await {
                    Ok(delivery) => delivery,
                    Err(BrokerError::Closed) => {
                        debug!("{} demultiplexer stopping: broker closed", stage);
                        return;
                    }
                    Err(e) => {
                        registry.consuming.store(false, Ordering::Relaxed);
                        error!(
                            "{} demultiplexer cannot consume {}: {}, retrying in {:?}",
                            stage, queue, e, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2).min(CONSUME_BACKOFF_MAX);
                        continue;
                    }
                };
                if !registry.consuming.swap(true, Ordering::Relaxed) {
                    info!("{} demultiplexer consuming {} again", stage, queue);
                }
                backoff = CONSUME_BACKOFF_BASE;

                match serde_json::from_slice::<ResultEnvelope>(&delivery.body) {
                    Ok(envelope) => {
                        let task_id = envelope.task_id;
                        if !registry.deliver(&task_id, delivery.body.clone()) {
                            metrics.record_orphaned_result(stage);
                            debug!(task_id = %task_id, "Dropping orphaned {} result", stage);
                        }
                    }
                    Err(e) => {
                        metrics.record_orphaned_result(stage);
                        warn!("Dropping {} result without a task id: {}", stage, e);
                    }
                }

                if let Err(e) = broker.ack(&delivery).await {
                    error!("{} demultiplexer failed to ack result: {}", stage, e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{declare_topology, InMemoryBroker, StageTopology};
    use std::time::Duration;

    #[test]
    fn test_deliver_reaches_only_its_waiter() {
        let registry = CorrelationRegistry::new(Stage::Detection);
        let mut a = registry.register(TaskId::from("a"));
        let mut b = registry.register(TaskId::from("b"));

        assert!(registry.deliver(&TaskId::from("b"), b"for b".to_vec()));
        assert_eq!(b.try_recv().unwrap(), b"for b".to_vec());
        assert!(a.try_recv().is_err());
        assert_eq!(registry.len(), 1);

        // Second delivery for the same id has nobody waiting
        assert!(!registry.deliver(&TaskId::from("b"), b"again".to_vec()));
    }

    #[test]
    fn test_dropped_receiver_makes_result_orphan() {
        let registry = CorrelationRegistry::new(Stage::Translation);
        let rx = registry.register(TaskId::from("gone"));
        drop(rx);
        assert!(!registry.deliver(&TaskId::from("gone"), Vec::new()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_demux_routes_and_acks() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = StageTopology::for_stage(Stage::Detection, Duration::from_secs(300));
        declare_topology(broker.as_ref(), &topology).await.unwrap();

        let registry = Arc::new(CorrelationRegistry::new(Stage::Detection));
        let metrics = Metrics::new();
        let rx = registry.register(TaskId::from("wanted"));
        let handle = ResultDemux::spawn(
            broker.clone(),
            registry.clone(),
            topology.results.clone(),
            metrics.clone(),
        );

        broker
            .publish(&topology.results, br#"{"task_id": "stray", "result": null}"#.to_vec())
            .await
            .unwrap();
        broker
            .publish(&topology.results, br#"{"task_id": "wanted", "result": null}"#.to_vec())
            .await
            .unwrap();

        let body = rx.await.unwrap();
        assert!(String::from_utf8(body).unwrap().contains("wanted"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stage(Stage::Detection).unwrap().orphaned_results, 1);
        assert_eq!(broker.depth(&topology.results).await.unwrap(), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_demux_retries_until_queue_exists() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = StageTopology::for_stage(Stage::Translation, Duration::from_secs(300));

        let registry = Arc::new(CorrelationRegistry::new(Stage::Translation));
        let rx = registry.register(TaskId::from("t-1"));
        let handle = ResultDemux::spawn(
            broker.clone(),
            registry.clone(),
            topology.results.clone(),
            Metrics::new(),
        );

        // Result queue not declared yet
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!registry.is_consuming());
        assert!(!handle.is_finished());

        declare_topology(broker.as_ref(), &topology).await.unwrap();
        broker
            .publish(&topology.results, br#"{"task_id": "t-1", "result": ["hi"]}"#.to_vec())
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(body).unwrap().contains("t-1"));
        assert!(registry.is_consuming());

        broker.close();
        handle.await.unwrap();
    }
}
