use crate::broker::Broker;
use crate::consumers::error::TopologyError;
use crate::consumers::ConsumerConfig;

/// Declares the queue a consumer reads from and binds it to its exchange.
///
/// Runs once per connection, before any subscription is registered.
pub(crate) struct TopologyInitializer {
    config: ConsumerConfig,
}

impl TopologyInitializer {
    pub(crate) fn new(config: ConsumerConfig) -> Self {
        Self { config }
    }

    /// Declare, then bind. The bind is skipped if the declaration fails.
    #[tracing::instrument(
        name = "setup_topology",
        skip_all,
        fields(
            queue = %self.config.queue,
            exchange = %self.config.exchange,
            routing_key = %self.config.routing_key,
        )
    )]
    pub(crate) async fn declare(&self, broker: &dyn Broker) -> Result<(), TopologyError> {
        let config = &self.config;
        broker
            .queue_declare(&config.queue_options())
            .await
            .map_err(|source| TopologyError::Declare {
                queue: config.queue.clone(),
                source,
            })?;
        tracing::debug!("Queue declared");

        broker
            .queue_bind(&config.queue, &config.exchange, &config.routing_key)
            .await
            .map_err(|source| TopologyError::Bind {
                queue: config.queue.clone(),
                exchange: config.exchange.clone(),
                routing_key: config.routing_key.clone(),
                source,
            })?;
        tracing::info!("Queue bound to exchange");
        Ok(())
    }
}
