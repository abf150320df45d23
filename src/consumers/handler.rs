use crate::consumers::Delivery;
use std::sync::Arc;

/// The application logic plugged into a [`Consumer`](crate::consumers::Consumer).
///
/// # Scope
///
/// `handle` does not get access to the broker.
/// The consumer takes care of acking/nacking the message according to the outcome of
/// processing: `Ok(())` acks, `Err(_)` nacks and requeues (with manual acknowledgement).
/// This decouples the low-level interactions with the message broker from the business logic
/// associated with the processing of a message.
///
/// # Blocking
///
/// `handle` runs on a blocking-capable thread, after the [`Plug`](crate::consumers::Plug)
/// chain. It can perform blocking I/O without starving the tasks receiving deliveries.
///
/// # Implementers
///
/// Closures of the form `Fn(&Delivery) -> Result<(), E>` can be used through [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Invoked once for every successfully established connection, before the queue topology
    /// is set up. Use it to start background work tied to the connection lifecycle.
    ///
    /// An error is fatal: the consumer stops without consuming any message.
    async fn on_connected(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Process a delivery that went through the whole plug chain.
    fn handle(&self, delivery: &Delivery) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn on_connected(&self) -> Result<(), anyhow::Error> {
        H::on_connected(self).await
    }

    fn handle(&self, delivery: &Delivery) -> Result<(), anyhow::Error> {
        H::handle(self, delivery)
    }
}

/// Wrapper type to turn a closure into a [`Handler`].
///
/// The closure does not need to return an `anyhow::Error` directly - any error type that can be
/// converted into one will do.
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, E> Handler for ClosureHandler<F>
where
    F: Fn(&Delivery) -> Result<(), E> + Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
{
    fn handle(&self, delivery: &Delivery) -> Result<(), anyhow::Error> {
        (self.0)(delivery).map_err(Into::into)
    }
}
