//! The set of broker operations a [`Consumer`](crate::consumers::Consumer) relies on.
//!
//! The consumer engine never talks to `lapin` directly: it goes through the [`Broker`] trait,
//! obtained from a [`Connector`] once per successful connection.
//!
//! Two implementations are provided:
//!
//! - [`ConnectionFactory`](crate::amqp::ConnectionFactory), backed by a real RabbitMq broker;
//! - [`MemoryBroker`], an in-memory broker for tests and local development.
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;
use std::sync::Arc;

mod memory;
mod rabbit_mq;

pub use memory::{BrokerCall, MemoryBroker};
pub use rabbit_mq::LapinBroker;

/// Errors returned by broker operations.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// The AMQP client library reported a failure.
    #[error("AMQP operation failed")]
    Amqp(#[from] lapin::Error),
    /// A delivery tag was acked/nacked through a consumer tag we know nothing about.
    #[error("Unknown consumer tag `{0}`")]
    UnknownConsumer(String),
    /// The connection to the broker is gone.
    #[error("The connection to the broker is closed")]
    Disconnected,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Properties of the queue declared by the topology initializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// A broker-level consumer subscription on a queue.
pub struct Subscription {
    /// The consumer tag assigned to this subscription.
    ///
    /// Required to ack/nack deliveries received through it.
    pub consumer_tag: String,
    /// Deliveries pushed by the broker, in broker order.
    ///
    /// The stream ends when the subscription is cancelled or its channel is closed.
    pub deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// Broker operations consumed by the consumer engine.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn queue_declare(&self, options: &QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Register a consumer subscription on `queue`.
    ///
    /// `tag_hint` is the consumer tag we would like the broker to use. A `prefetch_limit` of `0`
    /// means "no limit".
    async fn basic_consume(
        &self,
        queue: &str,
        tag_hint: &str,
        auto_ack: bool,
        prefetch_limit: u16,
    ) -> Result<Subscription, BrokerError>;

    async fn basic_ack(&self, consumer_tag: &str, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(
        &self,
        consumer_tag: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    /// Stop the broker from pushing more deliveries to a subscription.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;
}

/// Establishes connections with a broker.
///
/// Each successful call hands out a new, owned broker handle: connections are never shared
/// between consumer instances.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Broker>, anyhow::Error>;
}

#[async_trait::async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self) -> Result<Arc<dyn Broker>, anyhow::Error> {
        C::connect(self).await
    }
}

/// assert it's object safe
type _CHECK = (Box<dyn Broker>, Box<dyn Connector>);
