use crate::consumers::{AckStrategy, Handler, HandlerFault, MessageContext};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The normalised outcome of running a message handler.
#[derive(Debug)]
pub enum HandlerResult {
    /// The handler completed and chose how the message should be acknowledged.
    Completed(AckStrategy),
    /// The handler failed, panicked, timed out or was abandoned because of a shutdown.
    Faulted(HandlerFault),
}

/// Runs a [`Handler`] against a message, making sure that whatever the handler does (return
/// an error, panic, hang) it comes back as a [`HandlerResult`].
///
/// `HandlerInvoker` never talks to the broker.
#[derive(Clone)]
pub struct HandlerInvoker {
    handler: Arc<dyn Handler>,
    timeout: Option<Duration>,
}

impl HandlerInvoker {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            timeout: None,
        }
    }

    /// Give up on handlers that take longer than `timeout` to complete.
    ///
    /// By default, handlers can run for as long as they want.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoke the handler, at most once.
    ///
    /// If `cancellation` has already fired, the handler is not invoked at all.
    ///
    /// The handler runs as its own task. If `cancellation` fires (or the timeout elapses) before
    /// it completes, we trip the message cancellation token and stop waiting: the task is
    /// detached, not killed. Shutdown is never held hostage by a handler that does not cooperate,
    /// at the price of letting that handler run to completion in the background.
    #[tracing::instrument(
        name = "invoke_handler",
        skip_all,
        fields(delivery_tag = message.delivery_tag()),
        level = tracing::Level::DEBUG
    )]
    pub async fn invoke(
        &self,
        message: Arc<MessageContext>,
        cancellation: &CancellationToken,
    ) -> HandlerResult {
        // Nobody would acknowledge the outcome: do not let the handler start at all.
        if cancellation.is_cancelled() {
            tracing::info!("Shutdown requested, not starting the message handler.");
            message.cancellation().cancel();
            return HandlerResult::Faulted(HandlerFault::cancelled(message));
        }

        let task = tokio::spawn({
            let handler = self.handler.clone();
            let message = message.clone();
            async move { handler.handle(message).await }
        });

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            // A handler that has already completed wins over a concurrent shutdown.
            biased;

            outcome = task => match outcome {
                Ok(Ok(ack)) => HandlerResult::Completed(ack),
                Ok(Err(e)) => HandlerResult::Faulted(HandlerFault::handler(message, e)),
                Err(e) if e.is_panic() => {
                    let panic = panic_message(e.into_panic());
                    tracing::error!(panic = %panic, "Message handler panicked.");
                    HandlerResult::Faulted(HandlerFault::panicked(message, panic))
                }
                // The runtime is shutting down and dropped the handler task.
                Err(_) => HandlerResult::Faulted(HandlerFault::cancelled(message)),
            },

            _ = cancellation.cancelled() => {
                tracing::info!("Shutdown requested, abandoning in-flight message handler.");
                message.cancellation().cancel();
                HandlerResult::Faulted(HandlerFault::cancelled(message))
            }

            _ = deadline => {
                tracing::warn!(timeout = ?self.timeout, "Message handler timed out, abandoning it.");
                message.cancellation().cancel();
                HandlerResult::Faulted(HandlerFault::timed_out(message))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "handler panicked with a non-string payload".to_owned(),
        },
    }
}
