use crate::broker::{Broker, Subscription};
use crate::consumers::pipeline::MessagePipeline;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A registered subscription and the task forwarding its deliveries to the pipeline.
pub(crate) struct Slot {
    pub(crate) consumer_tag: String,
    pub(crate) task: JoinHandle<()>,
}

/// Turns a queue into `consumer_count` competing broker subscriptions, all feeding the same
/// [`MessagePipeline`].
///
/// Each subscription gets its own task: deliveries received through a subscription are
/// processed one at a time, in the order the broker pushed them. Different subscriptions
/// progress independently of each other.
pub(crate) struct ConsumerBridge {
    queue: String,
    consumer_count: u16,
    auto_ack: bool,
    prefetch_limit: u16,
    pipeline: Arc<MessagePipeline>,
}

impl ConsumerBridge {
    pub(crate) fn new(
        queue: String,
        consumer_count: u16,
        auto_ack: bool,
        prefetch_limit: u16,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        Self {
            queue,
            consumer_count,
            auto_ack,
            prefetch_limit,
            pipeline,
        }
    }

    /// Register the subscriptions and start forwarding their deliveries.
    ///
    /// A failed registration is logged and skipped: it does not affect the other subscriptions.
    /// The returned slots are the ones that were registered successfully.
    #[tracing::instrument(
        name = "register_subscriptions",
        skip_all,
        fields(queue = %self.queue, consumer_count = self.consumer_count)
    )]
    pub(crate) async fn register(&self, broker: &dyn Broker) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(self.consumer_count.into());
        for ordinal in 0..self.consumer_count {
            let tag_hint = Uuid::new_v4().to_string();
            match broker
                .basic_consume(&self.queue, &tag_hint, self.auto_ack, self.prefetch_limit)
                .await
            {
                Ok(subscription) => {
                    tracing::info!(
                        ordinal,
                        consumer_tag = %subscription.consumer_tag,
                        "Subscription registered"
                    );
                    slots.push(self.spawn(subscription));
                }
                Err(e) => {
                    tracing::error!(ordinal, error = ?e, "Failed to register subscription");
                }
            }
        }
        slots
    }

    fn spawn(&self, subscription: Subscription) -> Slot {
        let Subscription {
            consumer_tag,
            mut deliveries,
        } = subscription;
        let pipeline = Arc::clone(&self.pipeline);
        let tag = consumer_tag.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                match delivery {
                    // The outcome has already been logged and acked/nacked by the pipeline.
                    Ok(delivery) => {
                        let _ = pipeline.dispatch(delivery).await;
                    }
                    Err(e) => {
                        tracing::error!(consumer_tag = %tag, error = ?e, "Subscription failed");
                        return;
                    }
                }
            }
            tracing::info!(consumer_tag = %tag, "Subscription ended");
        });
        Slot { consumer_tag, task }
    }
}
