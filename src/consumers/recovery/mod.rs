//! What to do with a message when its handler fails.
//!
//! Check out [`ErrorRecoveryStrategy`] as a starting point. Two plug-and-play strategies are
//! provided: [`ImmediateReject`] and [`RetryLimited`]. [`RecoverySettings`] picks one of them
//! out of configuration values.
use crate::consumers::{AckStrategy, HandlerFault, MessageContext};

mod configuration;
mod dead_letter;
mod immediate_reject;
mod retry_limited;

pub use configuration::{DeadLetterSettings, RecoverySettings};
pub use dead_letter::{DeadLetterError, DeadLetterPublisher, ErrorEnvelope, ErrorExchangePublisher};
pub use immediate_reject::ImmediateReject;
pub use retry_limited::{RetryLimited, DEFAULT_TRACKED_MESSAGES};

/// A policy to turn a handler failure into an acknowledgment decision.
///
/// # Use case
///
/// The [`HandlerRunner`] asks the error recovery strategy what to do every time a handler
/// returns an error, panics or times out. The strategy can requeue the message to have it
/// delivered again, reject it (sending it to the dead letter exchange if one is configured)
/// or acknowledge it to drop it on the floor.
///
/// Retries are broker-level: requeued messages come back as brand-new deliveries, the runner
/// never invokes a handler twice for the same delivery.
///
/// # Side effects
///
/// Strategies can log, collect metrics or republish the failed message elsewhere (see
/// [`DeadLetterPublisher`]). They must not acknowledge the message themselves.
///
/// # Concurrency
///
/// A single strategy instance serves all messages in flight on a consumer: it will be called
/// concurrently for different delivery tags.
///
/// [`HandlerRunner`]: crate::consumers::HandlerRunner
#[async_trait::async_trait]
pub trait ErrorRecoveryStrategy: Send + Sync + 'static {
    /// Pick the acknowledgment action for a message whose handler failed.
    async fn handle_fault(&self, message: &MessageContext, fault: &HandlerFault) -> AckStrategy;

    /// Pick the acknowledgment action for a message whose handler was abandoned because the
    /// consumer is shutting down.
    ///
    /// By default, nothing is sent to the broker: the channel is about to go away and
    /// the broker will redeliver the message once it does.
    async fn handle_cancellation(&self, _message: &MessageContext) -> Option<AckStrategy> {
        None
    }

    /// Called when a handler completes successfully.
    ///
    /// Useful to release any per-message state accumulated in previous failed attempts.
    async fn handle_completion(&self, _message: &MessageContext) {}
}

/// assert it's object safe
type _CHECK = Box<dyn ErrorRecoveryStrategy>;
