use crate::amqp::AckChannel;
use crate::consumers::AckFault;
use amq_protocol_types::DeliveryTag;
use std::fmt;
use std::str::FromStr;

/// The action we ask the broker to take when finalising the processing of a message.
///
/// Message handlers return an `AckStrategy` on success; [`ErrorRecoveryStrategy`]s pick one
/// when the handler fails. Either way, the [`HandlerRunner`] executes it exactly once against
/// the channel the message was delivered on.
///
/// Messages are always acknowledged individually (`multiple = false`).
///
/// [`ErrorRecoveryStrategy`]: crate::consumers::recovery::ErrorRecoveryStrategy
/// [`HandlerRunner`]: crate::consumers::HandlerRunner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStrategy {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message should be requeued to retry processing,
    /// possibly by another consumer.
    NackWithRequeue,
    /// Rejection. The message should NOT be requeued: the broker drops it or sends it to
    /// the dead letter exchange, if configured.
    NackWithoutRequeue,
    /// Same as [`AckStrategy::NackWithRequeue`], but a failure of the channel call is logged
    /// and swallowed.
    ///
    /// Meant for channels that are already known to be going away (e.g. during shutdown).
    RequeueIgnoringFailure,
    /// Same as [`AckStrategy::NackWithoutRequeue`], but a failure of the channel call is logged
    /// and swallowed.
    DropIgnoringFailure,
}

impl AckStrategy {
    pub const ALL: [AckStrategy; 5] = [
        Self::Ack,
        Self::NackWithRequeue,
        Self::NackWithoutRequeue,
        Self::RequeueIgnoringFailure,
        Self::DropIgnoringFailure,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackWithRequeue => "nack_with_requeue",
            Self::NackWithoutRequeue => "nack_without_requeue",
            Self::RequeueIgnoringFailure => "requeue_ignoring_failure",
            Self::DropIgnoringFailure => "drop_ignoring_failure",
        }
    }

    /// Returns `true` if the broker is asked to make the message available again.
    pub fn requeues(&self) -> bool {
        matches!(self, Self::NackWithRequeue | Self::RequeueIgnoringFailure)
    }

    fn ignores_failure(&self) -> bool {
        matches!(
            self,
            Self::RequeueIgnoringFailure | Self::DropIgnoringFailure
        )
    }

    /// Issue the broker call for this strategy.
    ///
    /// Exactly one call is made against `channel`. It is never retried: if it fails, the
    /// channel is presumed broken and the failure is reported as an [`AckFault`] (unless the
    /// strategy ignores failures).
    pub async fn execute<C>(self, channel: &C, delivery_tag: DeliveryTag) -> Result<(), AckFault>
    where
        C: AckChannel + ?Sized,
    {
        let outcome = match self {
            Self::Ack => channel.basic_ack(delivery_tag, false).await,
            Self::NackWithRequeue | Self::RequeueIgnoringFailure => {
                channel.basic_nack(delivery_tag, false, true).await
            }
            Self::NackWithoutRequeue | Self::DropIgnoringFailure => {
                channel.basic_reject(delivery_tag, false).await
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if self.ignores_failure() => {
                tracing::warn!(
                    error = %e,
                    delivery_tag,
                    "Failed to {} message, ignoring the failure.",
                    self
                );
                Ok(())
            }
            Err(e) => Err(AckFault {
                delivery_tag,
                action: self,
                source: e,
            }),
        }
    }
}

impl fmt::Display for AckStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("`{0}` is not a known acknowledgment strategy.")]
pub struct ParseAckStrategyError(String);

impl FromStr for AckStrategy {
    type Err = ParseAckStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| ParseAckStrategyError(s.to_owned()))
    }
}
