use crate::broker::BrokerError;

/// A [`ConsumerConfig`](crate::consumers::ConsumerConfig) that cannot be used.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("The queue name cannot be empty.")]
    EmptyQueueName,
    #[error("`consumer_count` must be at least 1.")]
    NoConsumers,
}

/// Queue declaration or binding failed.
///
/// Topology failures are fatal: a misconfigured topology does not fix itself with retries.
#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("Failed to declare queue `{queue}`.")]
    Declare {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("Failed to bind queue `{queue}` to exchange `{exchange}` with routing key `{routing_key}`.")]
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },
}

/// Unrecoverable errors that stop a [`Consumer`](crate::consumers::Consumer).
///
/// Connection failures are not part of this list: they are retried forever.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer configuration.")]
    Config(#[from] ConfigError),
    #[error("Failed to set up the queue topology.")]
    Topology(#[from] TopologyError),
    #[error("The on-connected hook failed.")]
    OnConnected(#[source] anyhow::Error),
    #[error("Failed to listen for shutdown signals.")]
    Signal(#[source] anyhow::Error),
}

/// Why processing a single delivery failed.
///
/// A failed delivery is nacked and requeued when acknowledgements are manual.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A plug rejected the delivery. The remaining plugs and the handler were skipped.
    #[error("Plug `{plug}` failed.")]
    Plug {
        plug: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("The handler failed to process the message.")]
    Handler(#[source] anyhow::Error),
    /// The processing task panicked or was cancelled.
    #[error("Message processing was aborted.")]
    Aborted(#[source] tokio::task::JoinError),
}
