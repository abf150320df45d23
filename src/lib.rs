//! `carrot-burrow` consumes messages from a RabbitMq queue, built on top of [`lapin`].
//!
//! A [`Consumer`](crate::consumers::Consumer) connects to the broker (retrying until it
//! succeeds), declares and binds its queue, then spreads the queue across a configurable number
//! of subscriptions. Every delivery goes through an ordered chain of
//! [`Plug`](crate::consumers::Plug)s and a [`Handler`](crate::consumers::Handler), and is
//! acked or nacked according to the outcome.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action against a local RabbitMq instance.

pub mod amqp;
pub mod broker;
pub mod consumers;
