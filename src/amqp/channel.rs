use amq_protocol_types::DeliveryTag;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use std::sync::Arc;

/// The acknowledgment surface of an AMQP channel.
///
/// A [`HandlerRunner`] is bound to a single channel - the one the message was delivered on -
/// and it issues exactly one of these calls for each delivery tag.
///
/// # Concurrency
///
/// The same channel is shared by all messages that are in flight for a consumer.
/// Implementers must be safe to call concurrently: `lapin::Channel` serializes frames
/// internally, so no extra locking is required on our side.
///
/// [`HandlerRunner`]: crate::consumers::HandlerRunner
#[async_trait::async_trait]
pub trait AckChannel: Send + Sync + 'static {
    /// Positive acknowledgement - the broker can remove the message from the queue.
    async fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool)
        -> Result<(), anyhow::Error>;

    /// Negative acknowledgement - the broker requeues the message if `requeue` is set,
    /// otherwise it drops it or routes it to the dead letter exchange.
    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error>;

    /// Rejection of a single message.
    async fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl AckChannel for lapin::Channel {
    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_ack(self, delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(anyhow::Error::from)
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_nack(self, delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(anyhow::Error::from)
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_reject(self, delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(anyhow::Error::from)
    }
}

/// Share a single channel between the runner and whoever owns it.
#[async_trait::async_trait]
impl<C> AckChannel for Arc<C>
where
    C: AckChannel + ?Sized,
{
    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), anyhow::Error> {
        C::basic_ack(self, delivery_tag, multiple).await
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        C::basic_nack(self, delivery_tag, multiple, requeue).await
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        C::basic_reject(self, delivery_tag, requeue).await
    }
}

/// assert it's object safe
type _CHECK = Box<dyn AckChannel>;
