use std::time::Duration;

use tracing::info;

use super::{Broker, QueueSpec};
use crate::core::errors::BrokerResult;
use crate::core::types::Stage;

/// Dead letters kept per stage unless configured otherwise
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 1000;

/// Queue names owned by one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTopology {
    pub stage: Stage,
    pub tasks: String,
    pub results: String,
    pub dead_letter: String,
    pub message_ttl: Duration,
    /// Nothing consumes dead letters, so their queue is capped
    pub dead_letter_limit: usize,
}

impl StageTopology {
    /// `<stage>_tasks`, `<stage>_results` and `<stage>_tasks.dead_letter`
    pub fn for_stage(stage: Stage, message_ttl: Duration) -> Self {
        let tasks = format!("{}_tasks", stage.as_str());
        Self {
            stage,
            results: format!("{}_results", stage.as_str()),
            dead_letter: format!("{}.dead_letter", tasks),
            tasks,
            message_ttl,
            dead_letter_limit: DEFAULT_DEAD_LETTER_LIMIT,
        }
    }

    #[must_use]
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit;
        self
    }

    pub fn task_queue_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.tasks)
            .durable()
            .with_ttl(self.message_ttl)
            .with_dead_letter(&self.dead_letter)
    }

    pub fn result_queue_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.results).durable()
    }

    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.dead_letter)
            .durable()
            .with_max_length(self.dead_letter_limit)
    }
}

/// Declare the queues of one stage.
///
/// The dead-letter queue goes first so the task queue never routes into a
/// missing queue.
pub async fn declare_topology(broker: &dyn Broker, topology: &StageTopology) -> BrokerResult<()> {
    broker.declare(topology.dead_letter_queue_spec()).await?;
    broker.declare(topology.task_queue_spec()).await?;
    broker.declare(topology.result_queue_spec()).await?;

    info!(
        "Declared {} topology: {} -> {} (dead letters: {}, ttl {:?})",
        topology.stage, topology.tasks, topology.results, topology.dead_letter, topology.message_ttl
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::core::errors::BrokerError;

    #[test]
    fn test_queue_names() {
        let topology = StageTopology::for_stage(Stage::Translation, Duration::from_secs(300));
        assert_eq!(topology.tasks, "translation_tasks");
        assert_eq!(topology.results, "translation_results");
        assert_eq!(topology.dead_letter, "translation_tasks.dead_letter");
        assert_eq!(topology.task_queue_spec().ttl, Some(Duration::from_secs(300)));
        assert_eq!(
            topology.dead_letter_queue_spec().max_length,
            Some(DEFAULT_DEAD_LETTER_LIMIT)
        );
        assert_eq!(
            topology.with_dead_letter_limit(5).dead_letter_queue_spec().max_length,
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_declare_is_idempotent_and_detects_conflicts() {
        let broker = InMemoryBroker::new();
        let topology = StageTopology::for_stage(Stage::Detection, Duration::from_secs(300));

        declare_topology(&broker, &topology).await.unwrap();
        declare_topology(&broker, &topology).await.unwrap();

        let conflicting = StageTopology::for_stage(Stage::Detection, Duration::from_secs(5));
        let err = declare_topology(&broker, &conflicting).await.unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed { queue } if queue == "detection_tasks"));
    }
}
