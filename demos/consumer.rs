use carrot_burrow::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use carrot_burrow::consumers::{plug, Consumer, ConsumerConfig, ConsumerState, Delivery, Handler};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG=carrot_burrow=debug to follow every delivery through the pipeline.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // The queue is declared (if missing) and bound to `amq.topic` when the consumer connects.
    // With `auto_ack` disabled a message is acked only once the handler succeeds, and nacked
    // (and requeued) otherwise.
    // Four subscriptions compete for messages: up to four orders are processed concurrently.
    let config = ConsumerConfig::new("amq.topic", "order.created", "demo.orders")
        .auto_ack(false)
        .prefetch_limit(10)
        .consumer_count(4);

    let consumer = Consumer::builder(config, connection_factory, OrderHandler)
        // Plugs run in the order they are registered, before the handler.
        // A failing plug short-circuits the chain: the handler is skipped and the message is
        // treated as failed.
        .with_plug(plug::from_fn("reject_empty", |delivery| {
            anyhow::ensure!(!delivery.data.is_empty(), "Empty payload");
            Ok(delivery)
        }))
        .with_plug(plug::from_fn("trim", |mut delivery: Delivery| {
            let trimmed = String::from_utf8_lossy(&delivery.data).trim().to_owned();
            delivery.data = trimmed.into_bytes();
            Ok(delivery)
        }))
        .build()?;

    let mut state = consumer.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current: ConsumerState = *state.borrow();
            tracing::info!(state = ?current, "Consumer state changed");
        }
    });

    // Try it out with
    // rabbitmqadmin publish exchange=amq.topic routing_key=order.created payload='{"id":1,"sku":"carrot"}'
    consumer.run_until_sigterm().await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: u64,
    sku: String,
}

struct OrderHandler;

#[async_trait::async_trait]
impl Handler for OrderHandler {
    async fn on_connected(&self) -> Result<(), anyhow::Error> {
        tracing::info!("Connected, warming up the stock cache");
        Ok(())
    }

    fn handle(&self, delivery: &Delivery) -> Result<(), anyhow::Error> {
        let order: OrderCreated = delivery.json()?;
        tracing::info!(
            order_id = order.id,
            sku = %order.sku,
            redelivered = delivery.redelivered,
            "Reserving stock"
        );
        Ok(())
    }
}
