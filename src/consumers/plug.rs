//! Plugs: ordered transforms applied to a delivery before it reaches the handler.
use crate::consumers::{Delivery, PipelineError};
use std::sync::Arc;

/// A step applied to every delivery before the [`Handler`](crate::consumers::Handler) runs.
///
/// Plugs validate, enrich or reshape a delivery. They run in registration order on a
/// blocking-capable thread, so they are free to perform blocking I/O.
///
/// Returning an error aborts the chain: the following plugs and the handler are skipped and
/// the delivery is treated as failed.
pub trait Plug: Send + Sync + 'static {
    /// Used in logs and in [`PipelineError::Plug`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn apply(&self, delivery: Delivery) -> Result<Delivery, anyhow::Error>;
}

impl<P: Plug + ?Sized> Plug for Arc<P> {
    fn name(&self) -> &str {
        P::name(self)
    }

    fn apply(&self, delivery: Delivery) -> Result<Delivery, anyhow::Error> {
        P::apply(self, delivery)
    }
}

/// A [`Plug`] built out of a closure, see [`from_fn`].
pub struct FnPlug<F> {
    name: String,
    f: F,
}

/// Turn a closure into a named [`Plug`].
///
/// ```
/// use carrot_burrow::consumers::plug;
///
/// let reject_empty = plug::from_fn("reject_empty", |delivery| {
///     anyhow::ensure!(!delivery.data.is_empty(), "Empty payload");
///     Ok(delivery)
/// });
/// # drop(reject_empty);
/// ```
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnPlug<F>
where
    F: Fn(Delivery) -> Result<Delivery, anyhow::Error> + Send + Sync + 'static,
{
    FnPlug {
        name: name.into(),
        f,
    }
}

impl<F> Plug for FnPlug<F>
where
    F: Fn(Delivery) -> Result<Delivery, anyhow::Error> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, delivery: Delivery) -> Result<Delivery, anyhow::Error> {
        (self.f)(delivery)
    }
}

/// The immutable, ordered plug chain of a consumer.
#[derive(Clone)]
pub(crate) struct PlugChain(Arc<[Arc<dyn Plug>]>);

impl Default for PlugChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PlugChain {
    pub(crate) fn new(plugs: Vec<Arc<dyn Plug>>) -> Self {
        Self(plugs.into())
    }

    /// Run every plug in order, stopping at the first failure.
    pub(crate) fn run(&self, delivery: Delivery) -> Result<Delivery, PipelineError> {
        self.0.iter().try_fold(delivery, |delivery, plug| {
            tracing::trace!(plug = plug.name(), "Applying plug");
            plug.apply(delivery).map_err(|source| PipelineError::Plug {
                plug: plug.name().to_owned(),
                source,
            })
        })
    }
}
