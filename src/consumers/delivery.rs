use crate::consumers::ack::AckTarget;
use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use std::borrow::{Borrow, Cow};

/// A message received from a queue, ready for processing.
///
/// `Delivery` is what flows through the plug chain and reaches the handler.
///
/// # Tags
///
/// `consumer_tag` and `delivery_tag` identify this specific broker delivery and are required to
/// ack/nack it. They are always populated by the subscription the delivery was received through.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The tag of the subscription this message was delivered to.
    pub consumer_tag: String,

    /// The delivery tag of the message.
    pub delivery_tag: u64,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: String,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: String,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl Delivery {
    /// Build a delivery carrying `data`, with empty exchange/routing key and default properties.
    pub fn new(
        consumer_tag: impl Into<String>,
        delivery_tag: u64,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.into(),
        }
    }

    pub(crate) fn from_lapin(consumer_tag: &str, delivery: lapin::message::Delivery) -> Self {
        Self {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }

    /// The identifiers needed to ack/nack this delivery with the broker.
    pub fn ack_target(&self) -> AckTarget {
        AckTarget {
            consumer_tag: self.consumer_tag.clone(),
            delivery_tag: self.delivery_tag,
        }
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Lookup a header by key.
    pub fn header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.properties.headers().as_ref()?.inner().get(key)
    }

    /// Lookup a header string value.
    ///
    /// Returns `None` if the header is missing or not a string.
    pub fn header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}
