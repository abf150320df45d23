//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use ack::AckTarget;
pub use configuration::ConsumerConfig;
pub use connection::{ConsumerState, DEFAULT_RETRY_INTERVAL};
pub use consumer::{Consumer, ConsumerBuilder};
pub use delivery::Delivery;
pub use error::{ConfigError, ConsumerError, PipelineError, TopologyError};
pub use handler::{ClosureHandler, Handler};
pub use plug::Plug;

mod ack;
mod bridge;
mod configuration;
mod connection;
mod consumer;
mod delivery;
mod error;
mod handler;
mod pipeline;
pub mod plug;
mod topology;
