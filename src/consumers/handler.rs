//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::{AckStrategy, MessageContext};
use std::future::Future;
use std::sync::Arc;

/// Implementers of the `Handler` trait process messages retrieved from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// It tells the framework how the message should be acknowledged by returning an
/// [`AckStrategy`], and the framework takes care of talking to the broker.
/// If `handle` fails (or panics, or takes too long) the configured
/// [`ErrorRecoveryStrategy`] decides what to do with the message instead.
///
/// # Redeliveries
///
/// Messages can be requeued and delivered again (to this or another consumer), therefore
/// handlers must tolerate processing the same message more than once.
///
/// # Cancellation
///
/// Each handler invocation runs in its own task. When the consumer shuts down, or when the
/// handler exceeds its timeout, the framework stops waiting for it and trips
/// [`MessageContext::cancellation`]. The task is not killed: check the token and stop as soon
/// as you can.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on [`ClosureHandler`] to wrap an async function with a matching signature -
/// `Fn(Arc<MessageContext>) -> Fut`.
///
/// [`ErrorRecoveryStrategy`]: crate::consumers::recovery::ErrorRecoveryStrategy
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<MessageContext>) -> Result<AckStrategy, anyhow::Error>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, message: Arc<MessageContext>) -> Result<AckStrategy, anyhow::Error> {
        H::handle(self, message).await
    }
}

/// Wrapper type to turn an async function into a [`Handler`].
///
/// The function can return any error type that can be converted into an `anyhow::Error`.
///
/// ```rust
/// use carrot_runner::consumers::{AckStrategy, ClosureHandler, Handler, MessageContext};
/// use std::sync::Arc;
///
/// async fn handle(message: Arc<MessageContext>) -> Result<AckStrategy, std::io::Error> {
///     println!("Received {} bytes", message.body().len());
///     Ok(AckStrategy::Ack)
/// }
///
/// let handler: Box<dyn Handler> = Box::new(ClosureHandler(handle));
/// ```
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Handler for ClosureHandler<F>
where
    F: Fn(Arc<MessageContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AckStrategy, E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn handle(&self, message: Arc<MessageContext>) -> Result<AckStrategy, anyhow::Error> {
        // `self.0`, in this case, is a function, which we are calling on its argument using
        // parenthesis notation - (self.0)(_)
        (self.0)(message).await.map_err(Into::into)
    }
}
