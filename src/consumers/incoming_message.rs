use amq_protocol_types::DeliveryTag;
use lapin::BasicProperties;
use tokio_util::sync::CancellationToken;

/// Delivery metadata assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceivedInfo {
    /// The tag of the consumer the message was delivered to.
    pub consumer_tag: String,
    /// Unique per channel and monotonically increasing.
    ///
    /// It is the only handle we have to acknowledge the message: it must be used exactly once.
    pub delivery_tag: DeliveryTag,
    /// Whether this message was redelivered.
    pub redelivered: bool,
    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: String,
    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: String,
    /// The name of the queue.
    pub queue: String,
}

/// A delivered message, ready for processing.
///
/// `MessageContext` is the input of our message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
///
/// It is built once per delivery and never mutated afterwards. The runner shares it behind an
/// `Arc` between the handler task and the error recovery strategy, which gets to look at the
/// very same body, properties and delivery metadata the handler saw.
#[derive(Debug)]
pub struct MessageContext {
    body: Vec<u8>,
    properties: BasicProperties,
    received_info: MessageReceivedInfo,
    cancellation: CancellationToken,
}

impl MessageContext {
    pub fn new(
        body: Vec<u8>,
        properties: BasicProperties,
        received_info: MessageReceivedInfo,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            body,
            properties,
            received_info,
            cancellation,
        }
    }

    /// Build a context out of a `lapin` delivery.
    ///
    /// `lapin` does not tell us which consumer or queue a delivery belongs to, hence the extra
    /// arguments.
    pub fn from_delivery(
        delivery: lapin::message::Delivery,
        consumer_tag: &str,
        queue: &str,
        cancellation: CancellationToken,
    ) -> Self {
        let received_info = MessageReceivedInfo {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            queue: queue.to_owned(),
        };
        Self::new(delivery.data, delivery.properties, received_info, cancellation)
    }

    /// The payload of the message in binary format.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The properties and the headers of the message.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn received_info(&self) -> &MessageReceivedInfo {
        &self.received_info
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.received_info.delivery_tag
    }

    /// Tripped when the consumer is shutting down or when the handler ran out of time.
    ///
    /// Long-running handlers should watch it and bail out early: once it fires, nobody is
    /// waiting for their outcome anymore.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
