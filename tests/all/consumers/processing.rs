use crate::helpers::{manual_ack_config, payload, wait_for_state, wait_until, Seen};
use carrot_burrow::broker::{BrokerCall, MemoryBroker};
use carrot_burrow::consumers::{
    plug, ClosureHandler, Consumer, ConsumerBuilder, ConsumerConfig, ConsumerState, Delivery,
    Plug,
};
use serde::Deserialize;
use shutdown_handler::ShutdownHandler;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// A consumer that records every delivery reaching its handler.
/// The handler fails on payloads starting with "poison".
fn recording_consumer(
    broker: &MemoryBroker,
    config: ConsumerConfig,
    seen: Seen,
) -> ConsumerBuilder {
    Consumer::builder(
        config,
        broker.clone(),
        ClosureHandler(move |delivery: &Delivery| -> Result<(), anyhow::Error> {
            seen.lock().unwrap().push(delivery.clone());
            anyhow::ensure!(!delivery.data.starts_with(b"poison"), "Poisoned message");
            Ok(())
        }),
    )
}

struct Running {
    shutdown: Arc<ShutdownHandler>,
    handle: JoinHandle<Result<(), carrot_burrow::consumers::ConsumerError>>,
}

impl Running {
    async fn start(consumer: Consumer) -> Self {
        let mut state = consumer.state();
        let shutdown = Arc::new(ShutdownHandler::new());
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { consumer.run_until_shutdown(shutdown.wait_for_signal()).await }
        });
        wait_for_state(&mut state, ConsumerState::Consuming).await;
        Self { shutdown, handle }
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn processed_messages_are_acked_through_the_subscription_they_arrived_on() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config().consumer_count(3);
    let queue = config.queue.clone();
    let seen = Seen::default();
    let consumer = recording_consumer(&broker, config, seen.clone())
        .build()
        .unwrap();
    let running = Running::start(consumer).await;

    // Act
    let mut expected = HashSet::new();
    for delivery_tag in 1..=9 {
        let consumer_tag = broker.publish(&queue, payload()).unwrap();
        expected.insert(BrokerCall::Ack {
            consumer_tag,
            delivery_tag,
        });
    }
    wait_until(|| broker.acks().len() == 9).await;
    running.stop().await;

    // Assert
    let acks: Vec<_> = broker.acks();
    assert_eq!(expected.len(), acks.len());
    for ack in acks {
        assert!(expected.contains(&ack), "Unexpected ack: {ack:?}");
    }
    assert!(broker.nacks().is_empty());
    // Every subscription got a share of the messages.
    let tags: HashSet<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|d| d.consumer_tag.clone())
        .collect();
    assert_eq!(3, tags.len());
}

#[tokio::test]
async fn failed_messages_are_nacked_and_requeued() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config();
    let queue = config.queue.clone();
    let consumer = recording_consumer(&broker, config, Seen::default())
        .build()
        .unwrap();
    let running = Running::start(consumer).await;

    // Act
    let consumer_tag = broker.publish(&queue, "poison pill").unwrap();
    broker.publish(&queue, payload()).unwrap();
    wait_until(|| broker.calls().len() >= 5).await;
    running.stop().await;

    // Assert
    assert_eq!(
        vec![BrokerCall::Nack {
            consumer_tag: consumer_tag.clone(),
            delivery_tag: 1,
            requeue: true
        }],
        broker.nacks()
    );
    assert_eq!(
        vec![BrokerCall::Ack {
            consumer_tag,
            delivery_tag: 2
        }],
        broker.acks()
    );
}

#[tokio::test]
async fn with_auto_ack_the_broker_is_never_asked_to_ack_or_nack() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config().auto_ack(true).consumer_count(2);
    let queue = config.queue.clone();
    let seen = Seen::default();
    let consumer = recording_consumer(&broker, config, seen.clone())
        .build()
        .unwrap();
    let running = Running::start(consumer).await;

    // Act
    for i in 0..6 {
        let body = if i % 2 == 0 {
            "poison".to_owned()
        } else {
            payload()
        };
        broker.publish(&queue, body);
    }
    wait_until(|| seen.lock().unwrap().len() == 6).await;
    running.stop().await;

    // Assert
    assert!(broker.acks().is_empty());
    assert!(broker.nacks().is_empty());
    assert!(broker
        .registrations()
        .iter()
        .all(|call| matches!(call, BrokerCall::Consume { auto_ack: true, .. })));
}

#[tokio::test]
async fn plugs_run_in_order_before_the_handler() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config();
    let queue = config.queue.clone();
    let seen = Seen::default();
    let suffix = |name: &'static str| {
        plug::from_fn(name, move |mut delivery: Delivery| {
            delivery.data.extend_from_slice(format!("-{name}").as_bytes());
            Ok(delivery)
        })
    };
    let more: Vec<Arc<dyn Plug>> = vec![Arc::new(suffix("c")), Arc::new(suffix("d"))];
    let consumer = recording_consumer(&broker, config, seen.clone())
        .with_plug(suffix("a"))
        .with_plug(suffix("b"))
        .with_plugs(more)
        .build()
        .unwrap();
    let running = Running::start(consumer).await;

    // Act
    broker.publish(&queue, "order");
    wait_until(|| broker.acks().len() == 1).await;
    running.stop().await;

    // Assert
    let seen = seen.lock().unwrap();
    assert_eq!(1, seen.len());
    assert_eq!(b"order-a-b-c-d".to_vec(), seen[0].data);
}

#[tokio::test]
async fn a_rejecting_plug_skips_the_handler_and_nacks() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config();
    let queue = config.queue.clone();
    let seen = Seen::default();
    let consumer = recording_consumer(&broker, config, seen.clone())
        .with_plug(plug::from_fn("reject_empty", |delivery| {
            anyhow::ensure!(!delivery.data.is_empty(), "Empty payload");
            Ok(delivery)
        }))
        .build()
        .unwrap();
    let running = Running::start(consumer).await;

    // Act
    broker.publish(&queue, Vec::<u8>::new());
    broker.publish(&queue, payload());
    wait_until(|| broker.acks().len() + broker.nacks().len() == 2).await;
    running.stop().await;

    // Assert
    assert_eq!(1, seen.lock().unwrap().len());
    assert!(matches!(
        broker.nacks()[..],
        [BrokerCall::Nack {
            delivery_tag: 1,
            requeue: true,
            ..
        }]
    ));
}

#[tokio::test]
async fn a_panicking_handler_does_not_stop_the_subscription() {
    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config();
    let queue = config.queue.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumer = Consumer::builder(
        config,
        broker.clone(),
        ClosureHandler(move |_: &Delivery| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("Unexpected state");
            }
            Ok::<_, anyhow::Error>(())
        }),
    )
    .build()
    .unwrap();
    let running = Running::start(consumer).await;

    // Act
    broker.publish(&queue, payload());
    broker.publish(&queue, payload());
    wait_until(|| broker.acks().len() == 1).await;
    running.stop().await;

    // Assert
    assert_eq!(2, calls.load(Ordering::SeqCst));
    assert_eq!(1, broker.nacks().len());
}

#[tokio::test]
async fn handlers_can_decode_json_payloads() {
    #[derive(Deserialize)]
    struct OrderCreated {
        id: u64,
        sku: String,
    }

    // Arrange
    let broker = MemoryBroker::new();
    let config = manual_ack_config();
    let queue = config.queue.clone();
    let orders = Arc::new(Mutex::new(vec![]));
    let sink = orders.clone();
    let consumer = Consumer::builder(
        config,
        broker.clone(),
        ClosureHandler(move |delivery: &Delivery| -> Result<(), anyhow::Error> {
            let order: OrderCreated = delivery.json()?;
            sink.lock().unwrap().push((order.id, order.sku));
            Ok(())
        }),
    )
    .build()
    .unwrap();
    let running = Running::start(consumer).await;

    // Act
    let body = serde_json::json!({ "id": 42, "sku": "carrot-7" });
    broker.publish(&queue, serde_json::to_vec(&body).unwrap());
    broker.publish(&queue, "not json");
    wait_until(|| broker.calls().len() >= 5).await;
    running.stop().await;

    // Assert
    assert_eq!(vec![(42, "carrot-7".to_owned())], *orders.lock().unwrap());
    assert_eq!(1, broker.acks().len());
    assert_eq!(1, broker.nacks().len());
}
