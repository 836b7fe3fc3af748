//! In-process broker.
//!
//! Follows the AMQP semantics the pipeline relies on: idempotent declaration,
//! manual acknowledgement, requeue to the head of the queue, dead-letter
//! routing for rejected and expired messages, and recovery of unacked
//! messages. TTL expiry is applied lazily whenever a queue is inspected.
//!
//! Nothing is persisted; `durable` is recorded for declaration equivalence
//! only.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Broker, DeathReason, DeathRecord, Delivery, QueueSpec, SettleOnDrop};
use crate::core::errors::{BrokerError, BrokerResult};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
    death: Option<DeathRecord>,
}

impl Message {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            enqueued_at: Instant::now(),
            redelivered: false,
            death: None,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    // Ordered by tag so recovery preserves delivery order
    unacked: BTreeMap<u64, Message>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    closed: bool,
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str) -> BrokerResult<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn push_back(&mut self, name: &str, message: Message) -> BrokerResult<()> {
        let queue = self.queue_mut(name)?;
        queue.ready.push_back(message);

        if let Some(max_length) = queue.spec.max_length {
            let overflow = queue.ready.len().saturating_sub(max_length);
            if overflow > 0 {
                queue.ready.drain(..overflow);
                warn!("{} full ({} messages), dropped {} oldest", name, max_length, overflow);
            }
        }

        queue.notify.notify_one();
        Ok(())
    }

    /// Route a message to the dead-letter queue of `from`
    fn dead_letter(&mut self, from: &str, mut message: Message, reason: DeathReason) {
        let target = self
            .queues
            .get(from)
            .and_then(|q| q.spec.dead_letter.clone());

        let Some(target) = target else {
            warn!("Dropping {:?} message from {}: no dead-letter queue", reason, from);
            return;
        };

        message.death = Some(DeathRecord {
            queue: from.to_string(),
            reason,
        });
        message.enqueued_at = Instant::now();
        message.redelivered = false;

        if self.push_back(&target, message).is_err() {
            warn!(
                "Dropping {:?} message from {}: dead-letter queue {} is not declared",
                reason, from, target
            );
        }
    }

    /// Move messages older than the queue TTL to its dead-letter queue
    fn expire(&mut self, name: &str) -> BrokerResult<()> {
        let queue = self.queue_mut(name)?;
        let Some(ttl) = queue.spec.ttl else {
            return Ok(());
        };

        let now = Instant::now();
        let (expired, alive): (Vec<Message>, Vec<Message>) = queue
            .ready
            .drain(..)
            .partition(|m| now.duration_since(m.enqueued_at) >= ttl);
        queue.ready = alive.into();

        if !expired.is_empty() {
            debug!("{} message(s) expired on {}", expired.len(), name);
        }
        for message in expired {
            self.dead_letter(name, message, DeathReason::Expired);
        }
        Ok(())
    }

    fn take_next(&mut self, name: &str) -> BrokerResult<Option<Delivery>> {
        self.expire(name)?;
        let tag = self.next_tag + 1;
        let queue = self.queue_mut(name)?;

        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };

        let delivery = Delivery {
            tag,
            queue: name.to_string(),
            body: message.body.clone(),
            redelivered: message.redelivered,
            death: message.death.clone(),
            settle_on_drop: None,
        };
        queue.unacked.insert(tag, message);
        self.next_tag = tag;
        Ok(Some(delivery))
    }

    fn settle(&mut self, delivery: &Delivery) -> BrokerResult<Message> {
        self.queue_mut(&delivery.queue)?
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })
    }
}

/// Requeue a delivery at the head of its queue unless it was settled
fn requeue_if_unsettled(state: Weak<Mutex<BrokerState>>, queue: String, tag: u64) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock();
    let Ok(queue_state) = state.queue_mut(&queue) else {
        return;
    };
    if let Some(mut message) = queue_state.unacked.remove(&tag) {
        message.redelivered = true;
        queue_state.ready.push_front(message);
        queue_state.notify.notify_one();
        debug!("Delivery {} on {} dropped unsettled, requeued", tag, queue);
    }
}

/// In-memory broker shared by every role running in this process.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the broker: pending and future `consume` calls fail with
    /// [`BrokerError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    /// Number of delivered but unacknowledged messages on a queue
    pub fn unacked(&self, queue: &str) -> BrokerResult<usize> {
        Ok(self.state.lock().queue_mut(queue)?.unacked.len())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, spec: QueueSpec) -> BrokerResult<()> {
        let mut state = self.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == spec => Ok(()),
            Some(_) => Err(BrokerError::PreconditionFailed { queue: spec.name }),
            None => {
                debug!("Declared queue {}", spec.name);
                state.queues.insert(spec.name.clone(), QueueState::new(spec));
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.push_back(queue, Message::new(body))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Delivery> {
        loop {
            let notify;
            let mut notified;
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                if let Some(mut delivery) = state.take_next(queue)? {
                    let weak = Arc::downgrade(&self.state);
                    let (name, tag) = (delivery.queue.clone(), delivery.tag);
                    delivery.settle_on_drop = Some(Arc::new(SettleOnDrop::new(move || {
                        requeue_if_unsettled(weak, name, tag)
                    })));
                    return Ok(delivery);
                }

                // Register interest before releasing the lock so a publish in
                // between is not missed
                notify = Arc::clone(&state.queue_mut(queue)?.notify);
                notified = Box::pin(notify.notified());
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.state.lock().settle(delivery)?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let mut message = state.settle(delivery)?;

        if requeue {
            message.redelivered = true;
            let queue = state.queue_mut(&delivery.queue)?;
            queue.ready.push_front(message);
            queue.notify.notify_one();
        } else {
            state.dead_letter(&delivery.queue, message, DeathReason::Rejected);
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> BrokerResult<usize> {
        let mut state = self.state.lock();
        let queue_state = state.queue_mut(queue)?;
        let recovered = std::mem::take(&mut queue_state.unacked);
        let count = recovered.len();

        // Oldest delivery ends up at the head
        for (_, mut message) in recovered.into_iter().rev() {
            message.redelivered = true;
            queue_state.ready.push_front(message);
        }
        if count > 0 {
            queue_state.notify.notify_one();
            debug!("Recovered {} unacked message(s) on {}", count, queue);
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> BrokerResult<usize> {
        let mut state = self.state.lock();
        state.expire(queue)?;
        Ok(state.queue_mut(queue)?.ready.len())
    }
}
