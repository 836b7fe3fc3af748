//! Message broker abstraction.
//!
//! - [`Broker`]: queue operations the worker shells and the orchestrator need
//! - [`Delivery`]: a consumed message that must be acked or rejected
//! - [`QueueSpec`]: declaration arguments (durability, TTL, dead-letter routing)
//! - [`AmqpBroker`]: RabbitMQ over AMQP 0.9.1, for stages in separate processes
//! - [`InMemoryBroker`]: in-process implementation with the same semantics
//!
//! Delivery is at-least-once. A consumed message stays unacknowledged until
//! the consumer acks it. Dropping a delivery without settling it returns the
//! message to the head of its queue, and `recover` hands every unacked message
//! out again; both set the `redelivered` flag.

pub mod amqp;
pub mod memory;
pub mod topology;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::BrokerResult;

pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;
pub use topology::{declare_topology, StageTopology, DEFAULT_DEAD_LETTER_LIMIT};

/// Why a message ended up in a dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// Rejected by a consumer without requeue
    Rejected,
    /// Sat in the queue longer than its TTL
    Expired,
}

/// Where and why a dead-lettered message died
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: DeathReason,
}

/// Runs once when the last clone of a delivery is dropped
pub(crate) struct SettleOnDrop(Option<Box<dyn FnOnce() + Send + Sync>>);

impl SettleOnDrop {
    pub(crate) fn new(on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(on_drop)))
    }
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if let Some(on_drop) = self.0.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for SettleOnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SettleOnDrop")
    }
}

/// A consumed message.
///
/// Must be acked or rejected. A delivery dropped unsettled is requeued, the
/// same as an AMQP consumer whose channel closes.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag, unique per broker
    pub tag: u64,
    /// Queue the message was consumed from
    pub queue: String,
    pub body: Vec<u8>,
    /// True when this message was handed out before and not acked
    pub redelivered: bool,
    /// Set for messages consumed from a dead-letter queue
    pub death: Option<DeathRecord>,
    pub(crate) settle_on_drop: Option<Arc<SettleOnDrop>>,
}

/// Queue declaration arguments.
///
/// Re-declaring a queue with identical arguments is a no-op; different
/// arguments are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Messages older than this are dead-lettered with [`DeathReason::Expired`]
    pub ttl: Option<Duration>,
    /// Queue receiving rejected and expired messages
    pub dead_letter: Option<String>,
    /// Ready messages kept at most; the oldest are dropped beyond this
    pub max_length: Option<usize>,
}

impl QueueSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            ttl: None,
            dead_letter: None,
            max_length: None,
        }
    }

    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Queue operations used by the pipeline.
///
/// All methods are `Send + Sync` so one broker handle can be shared between
/// the orchestrator, the result demultiplexers and every worker shell.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Idempotent for identical arguments.
    async fn declare(&self, spec: QueueSpec) -> BrokerResult<()>;

    /// Append a message to a declared queue.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> BrokerResult<()>;

    /// Wait for the next message on a queue.
    ///
    /// The message stays unacknowledged until [`Broker::ack`] or
    /// [`Broker::reject`] is called with the returned delivery.
    async fn consume(&self, queue: &str) -> BrokerResult<Delivery>;

    /// Acknowledge a delivery, removing the message for good.
    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Reject a delivery.
    ///
    /// With `requeue` the message goes back to the head of its queue marked
    /// redelivered; otherwise it is routed to the queue's dead-letter queue.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()>;

    /// Return every unacknowledged message of a queue for redelivery.
    async fn recover(&self, queue: &str) -> BrokerResult<usize>;

    /// Number of messages ready for delivery.
    async fn depth(&self, queue: &str) -> BrokerResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_spec_builder() {
        let spec = QueueSpec::new("detection_tasks")
            .durable()
            .with_ttl(Duration::from_secs(300))
            .with_dead_letter("detection_tasks.dead_letter")
            .with_max_length(10);

        assert_eq!(spec.name, "detection_tasks");
        assert_eq!(spec.max_length, Some(10));
        assert!(spec.durable);
        assert_eq!(spec.ttl, Some(Duration::from_secs(300)));
        assert_eq!(spec.dead_letter.as_deref(), Some("detection_tasks.dead_letter"));
        assert_ne!(spec, QueueSpec::new("detection_tasks").durable());
    }
}
