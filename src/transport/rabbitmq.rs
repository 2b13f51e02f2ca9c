use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicGetOptions, BasicRejectOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tokio::sync::Mutex;

use crate::transport::{CountMessages, Driver, RawRecord};

/// RabbitMQ queue driver.
///
/// Pulls messages from a single queue with `basic.get` over a shared
/// `lapin::Channel`.
///
/// ## Design
///
/// - Messages are fetched with manual acknowledgement, so each one stays
///   unacked at the broker until resolved
/// - `commit` maps to `basic.ack`
/// - `discard` maps to `basic.reject` without requeue; the broker drops the
///   message or dead-letters it if the queue has a dead-letter exchange
/// - Unresolved messages are requeued by the broker when the channel closes
///
/// The channel is wrapped in `Arc<Mutex<_>>` so it can be shared with
/// publishers on the same connection.
pub struct RabbitMq {
    /// Shared AMQP channel.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Source queue name.
    queue: String,
}

impl RabbitMq {
    pub fn new(channel: lapin::Channel, queue: impl Into<String>) -> Self {
        Self::with_shared_channel(Arc::new(Mutex::new(channel)), queue)
    }

    pub fn with_shared_channel(
        channel: Arc<Mutex<lapin::Channel>>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Driver for RabbitMq {
    type Error = lapin::Error;
    /// AMQP delivery tag.
    type Handle = u64;

    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    async fn fetch(&mut self, max: usize) -> Result<Vec<RawRecord<u64>>, lapin::Error> {
        let channel = self.channel.lock().await;
        let mut records = Vec::new();

        while records.len() < max {
            let Some(message) = channel
                .basic_get(&self.queue, BasicGetOptions { no_ack: false })
                .await?
            else {
                break;
            };

            let delivery = message.delivery;
            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_owned())
                .unwrap_or_else(|| delivery.delivery_tag.to_string());

            records.push(RawRecord {
                handle: delivery.delivery_tag,
                message_id,
                payload: delivery.data.into(),
                // The broker only tells whether the message was delivered before.
                redeliveries: u32::from(delivery.redelivered),
            });
        }

        Ok(records)
    }

    async fn commit(&mut self, delivery_tag: u64) -> Result<(), lapin::Error> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
    }

    async fn discard(&mut self, delivery_tag: u64) -> Result<(), lapin::Error> {
        let channel = self.channel.lock().await;
        channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
    }
}

#[async_trait]
impl CountMessages for RabbitMq {
    type Error = lapin::Error;

    /// Ready messages reported by a passive queue declaration.
    async fn message_count(&self) -> Result<usize, lapin::Error> {
        let channel = self.channel.lock().await;
        let queue = channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count() as usize)
    }
}
