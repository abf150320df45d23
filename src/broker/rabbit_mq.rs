//! [`Broker`] implementation on top of a `lapin` connection.
use crate::broker::{Broker, BrokerError, QueueOptions, Subscription};
use crate::consumers::Delivery;
use futures_util::{Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A [`Broker`] backed by a RabbitMq connection.
///
/// Topology operations run on a dedicated channel. Every subscription gets a channel of its own,
/// so that the prefetch limit applies to each subscription independently; acks and nacks are
/// routed to the channel owning the consumer tag, since delivery tags are channel-scoped.
pub struct LapinBroker {
    connection: Connection,
    topology_channel: Mutex<Option<Channel>>,
    consumer_channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl LapinBroker {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            topology_channel: Mutex::new(None),
            consumer_channels: Arc::default(),
        }
    }

    /// Lazily open the channel used for queue declarations and bindings.
    async fn topology_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.topology_channel.lock().await;
        match guard.as_ref() {
            Some(channel) if channel.status().connected() => Ok(channel.clone()),
            _ => {
                let channel = self.connection.create_channel().await?;
                *guard = Some(channel.clone());
                Ok(channel)
            }
        }
    }

    async fn consumer_channel(&self, consumer_tag: &str) -> Result<Channel, BrokerError> {
        self.consumer_channels
            .read()
            .await
            .get(consumer_tag)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer_tag.to_owned()))
    }
}

#[async_trait::async_trait]
impl Broker for LapinBroker {
    async fn queue_declare(&self, options: &QueueOptions) -> Result<(), BrokerError> {
        self.topology_channel()
            .await?
            .queue_declare(
                &options.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.topology_channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag_hint: &str,
        auto_ack: bool,
        prefetch_limit: u16,
    ) -> Result<Subscription, BrokerError> {
        let channel = self.connection.create_channel().await?;
        let consumer = match subscribe(&channel, queue, tag_hint, auto_ack, prefetch_limit).await {
            Ok(consumer) => consumer,
            Err(e) => {
                if let Err(close_error) = channel.close(200, "Subscription failed").await {
                    tracing::warn!(error = ?close_error, "Failed to close subscription channel");
                }
                return Err(e.into());
            }
        };
        let consumer_tag = consumer.tag().as_str().to_owned();
        self.consumer_channels
            .write()
            .await
            .insert(consumer_tag.clone(), channel.clone());

        let tag = consumer_tag.clone();
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|d| Delivery::from_lapin(&tag, d))
                .map_err(BrokerError::from)
        });
        // Acks for the last delivery are sent before the stream is polled again, so the channel
        // can go once the stream is exhausted.
        let registry = Arc::clone(&self.consumer_channels);
        let tag = consumer_tag.clone();
        let cleanup = async move {
            registry.write().await.remove(&tag);
            if let Err(e) = channel.close(200, "Subscription ended").await {
                tracing::debug!(
                    error = ?e,
                    consumer_tag = %tag,
                    "Subscription channel already closed"
                );
            }
        };
        Ok(Subscription {
            consumer_tag,
            deliveries: with_cleanup(deliveries, cleanup).boxed(),
        })
    }

    async fn basic_ack(&self, consumer_tag: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        self.consumer_channel(consumer_tag)
            .await?
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_nack(
        &self,
        consumer_tag: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.consumer_channel(consumer_tag)
            .await?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.consumer_channel(consumer_tag)
            .await?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

async fn subscribe(
    channel: &Channel,
    queue: &str,
    tag_hint: &str,
    auto_ack: bool,
    prefetch_limit: u16,
) -> Result<lapin::Consumer, lapin::Error> {
    channel
        .basic_qos(prefetch_limit, BasicQosOptions { global: false })
        .await?;
    channel
        .basic_consume(
            queue,
            tag_hint,
            BasicConsumeOptions {
                no_ack: auto_ack,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
}

/// Yield every item of `stream`, then run `cleanup` once the stream is exhausted.
fn with_cleanup<S>(
    stream: S,
    cleanup: impl Future<Output = ()> + Send + 'static,
) -> impl Stream<Item = S::Item> + Send + 'static
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    stream
        .map(Some)
        .chain(futures_util::stream::once(async move {
            cleanup.await;
            None
        }))
        .filter_map(futures_util::future::ready)
}
