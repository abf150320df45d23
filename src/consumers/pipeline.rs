use crate::consumers::ack::AckController;
use crate::consumers::plug::PlugChain;
use crate::consumers::{Delivery, Handler, PipelineError};
use std::sync::Arc;

/// The single dispatch target all the subscriptions of a consumer feed into.
///
/// For every delivery it runs the plug chain and the handler on the blocking thread pool, then
/// translates the outcome into an ack/nack with the broker.
pub(crate) struct MessagePipeline {
    /// The queue this pipeline processes deliveries for.
    queue: String,
    auto_ack: bool,
    plugs: PlugChain,
    handler: Arc<dyn Handler>,
    acks: AckController,
}

impl MessagePipeline {
    pub(crate) fn new(
        queue: String,
        auto_ack: bool,
        plugs: PlugChain,
        handler: Arc<dyn Handler>,
        acks: AckController,
    ) -> Self {
        Self {
            queue,
            auto_ack,
            plugs,
            handler,
            acks,
        }
    }

    /// Process an incoming message - plugs, handler, ack/nack against the broker.
    ///
    /// The ack/nack decision is taken only once plugs and handler have completed.
    /// The returned value is the processing outcome; the result of the ack/nack call itself is
    /// only logged.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(
            queue = %self.queue,
            consumer_tag = %delivery.consumer_tag,
            delivery_tag = delivery.delivery_tag,
        ),
        level = tracing::Level::DEBUG
    )]
    pub(crate) async fn dispatch(&self, delivery: Delivery) -> Result<(), PipelineError> {
        let target = delivery.ack_target();
        let plugs = self.plugs.clone();
        let handler = Arc::clone(&self.handler);

        // Plugs and handler may block: keep them off the tasks bridging broker deliveries.
        let outcome = tokio::task::spawn_blocking(move || {
            let delivery = plugs.run(delivery)?;
            handler.handle(&delivery).map_err(PipelineError::Handler)
        })
        .await
        .unwrap_or_else(|e| Err(PipelineError::Aborted(e)));

        if let Err(e) = &outcome {
            if self.auto_ack {
                // The broker dropped the message when it delivered it: there is nothing to nack.
                tracing::error!(
                    error = ?e,
                    "Failed to process message. Auto-ack is enabled: the message is lost"
                );
            } else {
                tracing::error!(error = ?e, "Failed to process message, requeueing it");
            }
        }
        match (outcome.is_ok(), self.auto_ack) {
            (true, false) => self.acks.ack(&target).await,
            (false, false) => self.acks.nack(&target).await,
            (_, true) => tracing::debug!("Message processed, auto-ack is enabled"),
        }
        outcome
    }
}
