use crate::broker::QueueOptions;
use crate::consumers::error::ConfigError;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

/// The topology and consumption parameters of a [`Consumer`](crate::consumers::Consumer).
///
/// The configuration is fixed for the whole lifetime of the consumer.
///
/// Only `exchange`, `routing_key` and `queue` are required when deserializing; every other
/// field falls back to the value used by [`ConsumerConfig::new`]:
///
/// | field            | default |
/// |------------------|---------|
/// | `durable`        | `true`  |
/// | `exclusive`      | `false` |
/// | `auto_delete`    | `false` |
/// | `auto_ack`       | `true`  |
/// | `prefetch_limit` | `0`     |
/// | `consumer_count` | `1`     |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerConfig {
    /// The exchange the queue is bound to.
    pub exchange: String,
    pub routing_key: String,
    /// The queue to consume from. It is declared if it does not exist.
    pub queue: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// If `true` the broker considers a message consumed as soon as it is delivered: the
    /// consumer never acks or nacks.
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    /// Maximum number of unacknowledged deliveries each subscription may hold.
    /// `0` means unlimited.
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub prefetch_limit: u16,
    /// How many broker-level subscriptions compete for messages on the queue.
    #[serde(
        default = "default_consumer_count",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub consumer_count: u16,
}

fn default_durable() -> bool {
    true
}

fn default_auto_ack() -> bool {
    true
}

fn default_consumer_count() -> u16 {
    1
}

impl ConsumerConfig {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            queue: queue.into(),
            durable: default_durable(),
            exclusive: false,
            auto_delete: false,
            auto_ack: default_auto_ack(),
            prefetch_limit: 0,
            consumer_count: default_consumer_count(),
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Switch between broker-side acknowledgement (`true`) and manual ack/nack (`false`).
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn prefetch_limit(mut self, prefetch_limit: u16) -> Self {
        self.prefetch_limit = prefetch_limit;
        self
    }

    #[must_use]
    pub fn consumer_count(mut self, consumer_count: u16) -> Self {
        self.consumer_count = consumer_count;
        self
    }

    /// Check the invariants that cannot be expressed in the type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        if self.consumer_count == 0 {
            return Err(ConfigError::NoConsumers);
        }
        Ok(())
    }

    pub(crate) fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            name: self.queue.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }
}
