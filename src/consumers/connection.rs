use crate::broker::{Broker, Connector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long to wait before trying to connect again after a failed attempt.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// The lifecycle stages of a [`Consumer`](crate::consumers::Consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not connected, either because we have not started yet or because the last connection
    /// attempt failed and we are waiting to retry.
    Disconnected,
    Connecting,
    /// Connected, setting up the topology and registering subscriptions.
    Connected,
    /// Subscriptions are registered and deliveries are being processed.
    Consuming,
    Stopped,
}

/// Obtains a broker connection, retrying at a fixed interval until it succeeds.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry_interval: Duration,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        retry_interval: Duration,
        state: Arc<watch::Sender<ConsumerState>>,
    ) -> Self {
        Self {
            connector,
            retry_interval,
            state,
        }
    }

    /// Connect to the broker.
    ///
    /// There is no cap on the number of attempts: this only returns once a connection has been
    /// established. Drop the future to stop retrying.
    pub(crate) async fn connect(&self) -> Arc<dyn Broker> {
        let mut attempt: u64 = 1;
        loop {
            self.state.send_replace(ConsumerState::Connecting);
            match self.connector.connect().await {
                Ok(broker) => {
                    tracing::info!(attempt, "Connected to the broker");
                    self.state.send_replace(ConsumerState::Connected);
                    return broker;
                }
                Err(e) => {
                    self.state.send_replace(ConsumerState::Disconnected);
                    tracing::warn!(
                        attempt,
                        error = ?e,
                        "Failed to connect to the broker. Retrying in {:?}",
                        self.retry_interval
                    );
                    tokio::time::sleep(self.retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }
}
