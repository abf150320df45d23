//! In-memory broker for tests and local development.
//!
//! [`MemoryBroker`] implements both [`Connector`] and [`Broker`]. It records every call it
//! receives, so that tests can assert on the exact sequence of topology/consume/ack operations,
//! and it can be scripted to fail specific operations.
//!
//! Published messages are distributed round-robin across the subscriptions registered on a
//! queue, mimicking how RabbitMq shares deliveries between competing consumers.
//! Nacked messages are recorded but never redelivered.
use crate::broker::{Broker, BrokerError, Connector, QueueOptions, Subscription};
use crate::consumers::Delivery;
use futures_util::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A broker operation, as recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BrokerCall {
    Declare(QueueOptions),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
        prefetch_limit: u16,
    },
    Ack {
        consumer_tag: String,
        delivery_tag: u64,
    },
    Nack {
        consumer_tag: String,
        delivery_tag: u64,
        requeue: bool,
    },
    Cancel {
        consumer_tag: String,
    },
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Default)]
struct Queue {
    options: Option<QueueOptions>,
    bindings: Vec<(String, String)>,
    subscribers: Vec<(String, DeliverySender)>,
    next_subscriber: usize,
    backlog: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    calls: Vec<BrokerCall>,
    connection_attempts: Vec<Instant>,
    failing_connections: usize,
    fail_declare: bool,
    fail_bind: bool,
    fail_acks: bool,
    failing_registrations: BTreeSet<usize>,
    registrations: usize,
    next_delivery_tag: u64,
}

/// An in-memory [`Broker`]. Cheap to clone: all clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` connection attempts will fail.
    pub fn fail_connections(&self, n: usize) {
        self.state().failing_connections = n;
    }

    /// Make every queue declaration fail.
    pub fn fail_declare(&self, fail: bool) {
        self.state().fail_declare = fail;
    }

    /// Make every queue binding fail.
    pub fn fail_bind(&self, fail: bool) {
        self.state().fail_bind = fail;
    }

    /// Make every ack/nack call fail. Calls are still recorded.
    pub fn fail_acks(&self, fail: bool) {
        self.state().fail_acks = fail;
    }

    /// Make the consume registrations with the given (0-based) ordinal fail.
    pub fn fail_registrations(&self, ordinals: impl IntoIterator<Item = usize>) {
        self.state().failing_registrations.extend(ordinals);
    }

    /// Publish a message on `queue`.
    ///
    /// The message is handed to the next subscription in round-robin order; the consumer tag of
    /// that subscription is returned. If the queue has no subscriptions the message is kept
    /// until one is registered and `None` is returned.
    pub fn publish(&self, queue: &str, data: impl Into<Vec<u8>>) -> Option<String> {
        let mut state = self.state();
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let data = data.into();
        let queue = state.queues.entry(queue.to_owned()).or_default();
        while !queue.subscribers.is_empty() {
            let index = queue.next_subscriber % queue.subscribers.len();
            let (consumer_tag, sender) = &queue.subscribers[index];
            let delivery = Delivery::new(consumer_tag.clone(), delivery_tag, data.clone());
            if sender.send(Ok(delivery)).is_ok() {
                queue.next_subscriber = index + 1;
                return Some(consumer_tag.clone());
            }
            // The receiving side is gone.
            queue.subscribers.remove(index);
        }
        queue.backlog.push_back(data);
        None
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state().calls.clone()
    }

    pub fn acks(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Ack { .. }))
            .collect()
    }

    pub fn nacks(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Nack { .. }))
            .collect()
    }

    pub fn registrations(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Consume { .. }))
            .collect()
    }

    /// When each connection attempt happened, failed ones included.
    pub fn connection_attempts(&self) -> Vec<Instant> {
        self.state().connection_attempts.clone()
    }

    /// The number of live subscriptions on `queue`.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.subscribers.len())
            .unwrap_or_default()
    }

    /// The `(exchange, routing_key)` pairs `queue` is bound to.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, anyhow::Error> {
        let mut state = self.state();
        state.connection_attempts.push(Instant::now());
        if state.failing_connections > 0 {
            state.failing_connections -= 1;
            return Err(anyhow::anyhow!("Connection refused"));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn queue_declare(&self, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Declare(options.clone()));
        if state.fail_declare {
            return Err(anyhow::anyhow!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                options.name
            )
            .into());
        }
        let queue = state.queues.entry(options.name.clone()).or_default();
        match &queue.options {
            Some(existing) if existing != options => Err(anyhow::anyhow!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                options.name
            )
            .into()),
            _ => {
                queue.options = Some(options.clone());
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Bind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        if state.fail_bind {
            return Err(anyhow::anyhow!("NOT_FOUND - no exchange '{exchange}'").into());
        }
        match state.queues.get_mut(queue) {
            Some(q) if q.options.is_some() => {
                q.bindings.push((exchange.to_owned(), routing_key.to_owned()));
                Ok(())
            }
            _ => Err(anyhow::anyhow!("NOT_FOUND - no queue '{queue}'").into()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag_hint: &str,
        auto_ack: bool,
        prefetch_limit: u16,
    ) -> Result<Subscription, BrokerError> {
        let mut state = self.state();
        let ordinal = state.registrations;
        state.registrations += 1;
        let consumer_tag = if tag_hint.is_empty() {
            format!("amq.ctag-{ordinal}")
        } else {
            tag_hint.to_owned()
        };
        state.calls.push(BrokerCall::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
            auto_ack,
            prefetch_limit,
        });
        if state.failing_registrations.contains(&ordinal) {
            return Err(anyhow::anyhow!("Channel closed while registering consumer").into());
        }

        let first_delivery_tag = state.next_delivery_tag;
        let q = match state.queues.get_mut(queue) {
            Some(q) if q.options.is_some() => q,
            _ => return Err(anyhow::anyhow!("NOT_FOUND - no queue '{queue}'").into()),
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog: Vec<Vec<u8>> = q.backlog.drain(..).collect();
        q.subscribers.push((consumer_tag.clone(), sender.clone()));
        let mut delivery_tag = first_delivery_tag;
        for data in backlog {
            delivery_tag += 1;
            let _ = sender.send(Ok(Delivery::new(consumer_tag.clone(), delivery_tag, data)));
        }
        state.next_delivery_tag = delivery_tag;

        let deliveries = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();
        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_ack(&self, consumer_tag: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Ack {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag,
        });
        if state.fail_acks {
            return Err(BrokerError::Disconnected);
        }
        Ok(())
    }

    async fn basic_nack(
        &self,
        consumer_tag: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Nack {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag,
            requeue,
        });
        if state.fail_acks {
            return Err(BrokerError::Disconnected);
        }
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Cancel {
            consumer_tag: consumer_tag.to_owned(),
        });
        let mut found = false;
        for queue in state.queues.values_mut() {
            let before = queue.subscribers.len();
            // Dropping the sender ends the subscription's delivery stream.
            queue.subscribers.retain(|(tag, _)| tag != consumer_tag);
            found |= queue.subscribers.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(BrokerError::UnknownConsumer(consumer_tag.to_owned()))
        }
    }
}
