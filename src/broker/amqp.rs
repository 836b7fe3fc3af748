//! RabbitMQ broker over AMQP 0.9.1.
//!
//! One connection and one publishing/consuming channel per process, with
//! prefetch 1 so a worker never holds more than the task it is running.
//! Queues are declared durable through the default exchange; TTL, dead-letter
//! routing and length limits travel as `x-` queue arguments so RabbitMQ
//! enforces them itself. Messages are published persistent and confirmed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, DeathReason, DeathRecord, Delivery, QueueSpec, SettleOnDrop};
use crate::core::config::BrokerConfig;
use crate::core::errors::{BrokerError, BrokerResult};

const PERSISTENT: u8 = 2;

/// Deliveries handed out and not yet settled, by delivery tag
type Pending = DashMap<u64, (String, Acker)>;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, Arc<Mutex<Consumer>>>>,
    pending: Arc<Pending>,
}

impl AmqpBroker {
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let connection =
            Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            "Connected to RabbitMQ at {}:{} (vhost {}, heartbeat {}s)",
            config.host, config.port, config.vhost, config.heartbeat
        );

        Ok(Self {
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
            pending: Arc::new(DashMap::new()),
        })
    }

    /// Close the connection; consumers then see [`BrokerError::Closed`].
    pub async fn close(&self) -> BrokerResult<()> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }

    async fn consumer(&self, queue: &str) -> BrokerResult<Arc<Mutex<Consumer>>> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(queue) {
            return Ok(Arc::clone(consumer));
        }

        let tag = format!("lens-{}-{}", queue, uuid::Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!("Consuming {} as {}", queue, tag);

        let consumer = Arc::new(Mutex::new(consumer));
        consumers.insert(queue.to_string(), Arc::clone(&consumer));
        Ok(consumer)
    }

    fn take_acker(&self, delivery: &Delivery) -> BrokerResult<Acker> {
        self.pending
            .remove(&delivery.tag)
            .map(|(_, (_, acker))| acker)
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })
    }
}

/// `x-` arguments RabbitMQ needs to enforce a [`QueueSpec`]
pub(crate) fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();

    if let Some(ttl) = spec.ttl {
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(ttl.as_millis() as i64),
        );
    }
    if let Some(dead_letter) = &spec.dead_letter {
        // Default exchange routes by queue name
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(dead_letter.as_str())),
        );
    }
    if let Some(max_length) = spec.max_length {
        args.insert(
            ShortString::from("x-max-length"),
            AMQPValue::LongLongInt(max_length as i64),
        );
    }
    args
}

/// Read the first-death headers RabbitMQ stamps on dead-lettered messages
pub(crate) fn death_record(headers: Option<&FieldTable>) -> Option<DeathRecord> {
    let headers = headers?.inner();
    let text = |key: &str| match headers.get(&ShortString::from(key)) {
        Some(AMQPValue::LongString(value)) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        _ => None,
    };

    let queue = text("x-first-death-queue")?;
    let reason = match text("x-first-death-reason")?.as_str() {
        "expired" => DeathReason::Expired,
        _ => DeathReason::Rejected,
    };
    Some(DeathRecord { queue, reason })
}

/// Requeue a delivery whose handle was dropped before it was settled
fn requeue_if_unsettled(pending: Weak<Pending>, tag: u64) {
    let Some(pending) = pending.upgrade() else {
        return;
    };
    let Some((_, (queue, acker))) = pending.remove(&tag) else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        // The channel closing requeues it anyway
        return;
    };
    runtime.spawn(async move {
        match acker.reject(BasicRejectOptions { requeue: true }).await {
            Ok(()) => debug!("Delivery {} on {} dropped unsettled, requeued", tag, queue),
            Err(e) => warn!("Failed to requeue dropped delivery {} on {}: {}", tag, queue, e),
        }
    });
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare(&self, spec: QueueSpec) -> BrokerResult<()> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(&spec.name, options, queue_arguments(&spec))
            .await?;
        debug!("Declared queue {}", spec.name);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> BrokerResult<()> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::NotConfirmed {
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Delivery> {
        let consumer = self.consumer(queue).await?;
        let message = consumer
            .lock()
            .await
            .next()
            .await
            .ok_or(BrokerError::Closed)??;

        let tag = message.delivery_tag;
        self.pending
            .insert(tag, (queue.to_string(), message.acker.clone()));

        let pending = Arc::downgrade(&self.pending);
        Ok(Delivery {
            tag,
            queue: queue.to_string(),
            death: death_record(message.properties.headers().as_ref()),
            redelivered: message.redelivered,
            body: message.data,
            settle_on_drop: Some(Arc::new(SettleOnDrop::new(move || {
                requeue_if_unsettled(pending, tag)
            }))),
        })
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.take_acker(delivery)?
            .ack(BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        self.take_acker(delivery)?
            .reject(BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn recover(&self, queue: &str) -> BrokerResult<usize> {
        // basic.recover would hit every queue on the channel; requeue this
        // queue's deliveries one by one instead
        let tags: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().0 == queue)
            .map(|entry| *entry.key())
            .collect();

        let mut recovered = 0;
        for tag in tags {
            if let Some((_, (_, acker))) = self.pending.remove(&tag) {
                acker.reject(BasicRejectOptions { requeue: true }).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!("Recovered {} unacked message(s) on {}", recovered, queue);
        }
        Ok(recovered)
    }

    async fn depth(&self, queue: &str) -> BrokerResult<usize> {
        // A passive declare of a missing queue closes its channel
        let scratch = self.connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let declared = scratch
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|_| BrokerError::QueueNotFound(queue.to_string()))?;
        let _ = scratch.close(200, "depth").await;
        Ok(declared.message_count() as usize)
    }
}
