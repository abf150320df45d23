use crate::broker::{Broker, Connector};
use crate::consumers::ack::AckController;
use crate::consumers::bridge::ConsumerBridge;
use crate::consumers::connection::{ConnectionManager, ConsumerState, DEFAULT_RETRY_INTERVAL};
use crate::consumers::pipeline::MessagePipeline;
use crate::consumers::plug::{Plug, PlugChain};
use crate::consumers::topology::TopologyInitializer;
use crate::consumers::{ConsumerConfig, ConsumerError, Handler};
use futures_util::{stream::FuturesUnordered, Future, FutureExt, StreamExt};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A RabbitMq queue consumer.
///
/// `Consumer` is the main entrypoint if you want to pull and process messages from a queue.
///
/// # Lifecycle
///
/// Once started with [`Consumer::run_until_shutdown`], a consumer:
///
/// 1. connects to the broker, retrying at a fixed interval until it succeeds;
/// 2. invokes [`Handler::on_connected`];
/// 3. declares its queue and binds it to the configured exchange;
/// 4. registers `consumer_count` subscriptions on the queue;
/// 5. runs every delivery through the plug chain and the handler, acking/nacking the message
///    according to the outcome when `auto_ack` is disabled.
///
/// Failures in steps 2 and 3 are fatal and are not retried.
///
/// Each subscription processes its deliveries sequentially, in the order the broker pushed them.
/// Up to `consumer_count` messages are processed concurrently.
///
/// # How do I build a `Consumer`?
///
/// The starting point is [`Consumer::builder`].
pub struct Consumer {
    config: ConsumerConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn Handler>,
    plugs: PlugChain,
    retry_interval: Duration,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl Consumer {
    /// Start building a [`Consumer`].
    ///
    /// # Connector
    ///
    /// The type implementing [`Connector`] is used to establish the connection with the message
    /// broker. Provided implementations: [`ConnectionFactory`](crate::amqp::ConnectionFactory)
    /// and [`MemoryBroker`](crate::broker::MemoryBroker).
    pub fn builder(
        config: ConsumerConfig,
        connector: impl Connector,
        handler: impl Handler,
    ) -> ConsumerBuilder {
        ConsumerBuilder {
            config,
            connector: Arc::new(connector),
            handler: Arc::new(handler),
            plugs: Vec::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Observe the lifecycle of the consumer.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run the consumer until the process receives a SIGTERM.
    ///
    /// You usually want to invoke `run_until_sigterm` at the end of your `main` function.
    pub async fn run_until_sigterm(self) -> Result<(), ConsumerError> {
        let shutdown = ShutdownHandler::sigterm().map_err(|e| ConsumerError::Signal(e.into()))?;
        self.run_until_shutdown(shutdown.wait_for_signal()).await
    }

    /// Run the consumer until `shutdown` resolves or a fatal error occurs.
    ///
    /// On shutdown every subscription is cancelled and the messages already delivered to the
    /// consumer are processed (and acked/nacked) before returning.
    /// If `shutdown` resolves while we are still trying to connect, retries stop immediately.
    #[tracing::instrument(
        skip_all,
        name = "consumer_run",
        fields(queue = %self.config.queue, exchange = %self.config.exchange)
    )]
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ConsumerError> {
        let outcome = self.run(shutdown).await;
        if let Err(e) = &outcome {
            tracing::error!(error = ?e, "Consumer failed");
        }
        self.state.send_replace(ConsumerState::Stopped);
        outcome
    }

    async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ConsumerError> {
        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let connection = ConnectionManager::new(
            Arc::clone(&self.connector),
            self.retry_interval,
            Arc::clone(&self.state),
        );
        let broker = tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::info!("Shutdown requested before a connection could be established");
                return Ok(());
            }
            broker = connection.connect() => broker,
        };

        self.handler
            .on_connected()
            .await
            .map_err(ConsumerError::OnConnected)?;
        TopologyInitializer::new(self.config.clone())
            .declare(broker.as_ref())
            .await?;

        let pipeline = MessagePipeline::new(
            self.config.queue.clone(),
            self.config.auto_ack,
            self.plugs.clone(),
            Arc::clone(&self.handler),
            AckController::new(Arc::clone(&broker)),
        );
        let bridge = ConsumerBridge::new(
            self.config.queue.clone(),
            self.config.consumer_count,
            self.config.auto_ack,
            self.config.prefetch_limit,
            Arc::new(pipeline),
        );
        let (consumer_tags, mut slots): (Vec<_>, FuturesUnordered<_>) = bridge
            .register(broker.as_ref())
            .await
            .into_iter()
            .map(|slot| (slot.consumer_tag, slot.task))
            .unzip();
        if slots.is_empty() {
            tracing::error!("No subscription could be registered, waiting for shutdown");
        }
        self.state.send_replace(ConsumerState::Consuming);

        loop {
            tokio::select! {
                // Prefer handling shutdown over clearing out finished subscriptions.
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Consumer received shutdown event");
                    break;
                }
                Some(outcome) = slots.next(), if !slots.is_empty() => {
                    if let Err(e) = outcome {
                        tracing::error!(error = ?e, "Subscription task aborted");
                    }
                }
            }
        }

        cancel(broker.as_ref(), &consumer_tags).await;
        // Make sure all deliveries in flight are processed before returning.
        while let Some(outcome) = slots.next().await {
            if let Err(e) = outcome {
                tracing::error!(error = ?e, "Subscription task aborted");
            }
        }
        tracing::info!("Consumer stopped");
        Ok(())
    }
}

async fn cancel(broker: &dyn Broker, consumer_tags: &[String]) {
    for consumer_tag in consumer_tags {
        if let Err(e) = broker.basic_cancel(consumer_tag).await {
            tracing::warn!(%consumer_tag, error = ?e, "Failed to cancel subscription");
        }
    }
}

/// Collects the optional settings of a [`Consumer`].
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn Handler>,
    plugs: Vec<Arc<dyn Plug>>,
    retry_interval: Duration,
}

impl ConsumerBuilder {
    /// Append a [`Plug`] to the chain.
    ///
    /// Plugs run in the order they were added, before the handler.
    /// The chain cannot be changed once the consumer has been built.
    #[must_use]
    pub fn with_plug(mut self, plug: impl Plug) -> Self {
        self.plugs.push(Arc::new(plug));
        self
    }

    /// Append several [`Plug`]s to the chain, preserving their order.
    #[must_use]
    pub fn with_plugs(mut self, plugs: impl IntoIterator<Item = Arc<dyn Plug>>) -> Self {
        self.plugs.extend(plugs);
        self
    }

    /// How long to wait between connection attempts.
    ///
    /// Defaults to [`DEFAULT_RETRY_INTERVAL`].
    #[must_use]
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Validate the configuration and build the [`Consumer`].
    pub fn build(self) -> Result<Consumer, ConsumerError> {
        self.config.validate()?;
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Ok(Consumer {
            config: self.config,
            connector: self.connector,
            handler: self.handler,
            plugs: PlugChain::new(self.plugs),
            retry_interval: self.retry_interval,
            state: Arc::new(state),
        })
    }
}
