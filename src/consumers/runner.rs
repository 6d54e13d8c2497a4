use crate::amqp::AckChannel;
use crate::consumers::recovery::ErrorRecoveryStrategy;
use crate::consumers::{
    AckFault, AckStrategy, FaultKind, HandlerFault, HandlerInvoker, HandlerResult, MessageContext,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives a single delivery from the message handler to the broker acknowledgment.
///
/// For each message, the runner:
///
/// 1. invokes the handler (see [`HandlerInvoker`]);
/// 2. if the handler failed, asks the [`ErrorRecoveryStrategy`] how the message should be
///    acknowledged;
/// 3. executes the chosen [`AckStrategy`] against the channel the message was delivered on.
///
/// Exactly one acknowledgment call is made per delivery tag - or none at all, if the handler
/// was abandoned because of a shutdown and the strategy does not ask for one.
///
/// # Failures
///
/// Handler failures never escape `process_delivery`: they are resolved into an acknowledgment
/// and reported in the [`ProcessingOutcome`].
/// A failed acknowledgment, instead, means the channel is broken: it is returned as an
/// [`AckFault`] and the caller is expected to tear down the consumer.
///
/// # Concurrency
///
/// The runner is meant to be shared (e.g. behind an `Arc`) by all the messages in flight on a
/// channel. It does not lock the channel.
pub struct HandlerRunner<C: AckChannel> {
    channel: C,
    invoker: HandlerInvoker,
    recovery: Arc<dyn ErrorRecoveryStrategy>,
}

/// What happened to a message.
///
/// [`ProcessingOutcome`] does not expose any constructor: only the runner can tell what was
/// sent to the broker.
#[derive(Debug)]
pub struct ProcessingOutcome {
    action: Option<AckStrategy>,
    fault: Option<HandlerFault>,
}

impl ProcessingOutcome {
    /// The acknowledgment sent to the broker.
    ///
    /// `None` if the handler was abandoned during a shutdown and no acknowledgment was sent.
    pub fn action(&self) -> Option<AckStrategy> {
        self.action
    }

    /// The handler failure that was recovered from, if any.
    pub fn fault(&self) -> Option<&HandlerFault> {
        self.fault.as_ref()
    }

    /// Returns `true` if the handler completed without failing.
    pub fn is_success(&self) -> bool {
        self.fault.is_none()
    }

    /// Returns `true` if we instructed the broker to make the message available again.
    pub fn was_requeued(&self) -> bool {
        self.action.is_some_and(|action| action.requeues())
    }
}

impl<C: AckChannel> HandlerRunner<C> {
    pub fn new(
        channel: C,
        invoker: HandlerInvoker,
        recovery: Arc<dyn ErrorRecoveryStrategy>,
    ) -> Self {
        Self {
            channel,
            invoker,
            recovery,
        }
    }

    /// The channel acknowledgments are sent on.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Process a delivered message - handler, error recovery, ack/nack against the AMQP broker.
    ///
    /// `cancellation` is the shutdown signal: if it fires while the handler is running, the
    /// handler is abandoned and [`ErrorRecoveryStrategy::handle_cancellation`] decides whether
    /// anything is sent to the broker.
    #[tracing::instrument(
        name = "process_delivery",
        skip_all,
        fields(
            delivery_tag = message.delivery_tag(),
            queue = %message.received_info().queue,
        ),
        level = tracing::Level::DEBUG
    )]
    pub async fn process_delivery(
        &self,
        message: MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<ProcessingOutcome, AckFault> {
        let message = Arc::new(message);
        let delivery_tag = message.delivery_tag();

        let (action, fault) = match self.invoker.invoke(message.clone(), cancellation).await {
            HandlerResult::Completed(action) => {
                tracing::debug!(%action, "Message handler completed.");
                self.recovery.handle_completion(&message).await;
                (Some(action), None)
            }
            HandlerResult::Faulted(fault) if fault.kind() == FaultKind::Cancelled => {
                let action = self.recovery.handle_cancellation(&message).await;
                (action, Some(fault))
            }
            HandlerResult::Faulted(fault) => {
                tracing::warn!(error = %fault, "Message handler failed, recovering.");
                let action = self.recovery.handle_fault(&message, &fault).await;
                (Some(action), Some(fault))
            }
        };

        let Some(action) = action else {
            tracing::debug!("Message abandoned, leaving it to the broker to redeliver it.");
            return Ok(ProcessingOutcome {
                action: None,
                fault,
            });
        };

        if let Err(e) = action.execute(&self.channel, delivery_tag).await {
            tracing::error!(error = %e, "Failed to acknowledge message.");
            return Err(e);
        }
        tracing::debug!(%action, "Message acknowledged.");

        Ok(ProcessingOutcome {
            action: Some(action),
            fault,
        })
    }
}
