use crate::broker::Broker;
use std::sync::Arc;

/// Identifies a specific broker delivery for acknowledgement purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckTarget {
    pub consumer_tag: String,
    pub delivery_tag: u64,
}

/// Issues ack/nack calls against the broker.
///
/// Both calls are fire-and-forget: the outcome of the broker call is logged and never returned
/// to the caller, so a failed ack/nack has no effect on the processing pipeline or on
/// redelivery decisions.
#[derive(Clone)]
pub(crate) struct AckController {
    broker: Arc<dyn Broker>,
}

impl AckController {
    pub(crate) fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Positive acknowledgement: the message can be removed from the queue.
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub(crate) async fn ack(&self, target: &AckTarget) {
        match self
            .broker
            .basic_ack(&target.consumer_tag, target.delivery_tag)
            .await
        {
            Ok(()) => tracing::debug!("Message acked"),
            Err(e) => tracing::error!(error = ?e, "Failed to ack message"),
        }
    }

    /// Negative acknowledgement: the message goes back to the queue to be redelivered.
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub(crate) async fn nack(&self, target: &AckTarget) {
        match self
            .broker
            .basic_nack(&target.consumer_tag, target.delivery_tag, true)
            .await
        {
            Ok(()) => tracing::debug!("Message nacked and requeued"),
            Err(e) => tracing::error!(error = ?e, "Failed to nack message"),
        }
    }
}
