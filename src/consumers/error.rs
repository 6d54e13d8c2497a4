use crate::consumers::{AckStrategy, MessageContext};
use amq_protocol_types::DeliveryTag;
use std::fmt;
use std::sync::Arc;

/// Why a message handler did not produce an [`AckStrategy`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FaultKind {
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    ///
    /// The panic is contained in the handler task: it never tears the consumer down.
    Panicked,
    /// The handler did not complete within the configured timeout.
    TimedOut,
    /// The consumer started shutting down before the handler completed.
    Cancelled,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler => write!(f, "handler error"),
            Self::Panicked => write!(f, "handler panic"),
            Self::TimedOut => write!(f, "handler timeout"),
            Self::Cancelled => write!(f, "cancellation"),
        }
    }
}

/// A message handler failed to process a message.
///
/// Handler faults never escape the [`HandlerRunner`]: they are resolved into an
/// [`AckStrategy`] by the configured [`ErrorRecoveryStrategy`].
///
/// The fault keeps a reference to the message that caused it - body, properties and delivery
/// metadata are left untouched, exactly as the handler received them.
///
/// [`HandlerRunner`]: crate::consumers::HandlerRunner
/// [`ErrorRecoveryStrategy`]: crate::consumers::recovery::ErrorRecoveryStrategy
#[derive(Debug)]
pub struct HandlerFault {
    kind: FaultKind,
    message: Arc<MessageContext>,
    error: Option<anyhow::Error>,
}

impl HandlerFault {
    pub(crate) fn handler(message: Arc<MessageContext>, error: anyhow::Error) -> Self {
        Self {
            kind: FaultKind::Handler,
            message,
            error: Some(error),
        }
    }

    pub(crate) fn panicked(message: Arc<MessageContext>, panic: String) -> Self {
        Self {
            kind: FaultKind::Panicked,
            message,
            error: Some(anyhow::anyhow!("{panic}")),
        }
    }

    pub(crate) fn timed_out(message: Arc<MessageContext>) -> Self {
        Self {
            kind: FaultKind::TimedOut,
            message,
            error: None,
        }
    }

    pub(crate) fn cancelled(message: Arc<MessageContext>) -> Self {
        Self {
            kind: FaultKind::Cancelled,
            message,
            error: None,
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// The message the handler was processing when it failed.
    pub fn message(&self) -> &MessageContext {
        &self.message
    }

    /// The error returned by the handler (or the panic payload), if any.
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of message {} from queue `{}` failed due to a {}",
            self.message.delivery_tag(),
            self.message.received_info().queue,
            self.kind
        )?;
        if let Some(error) = &self.error {
            write!(f, ".\n{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HandlerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

/// The acknowledgment call itself failed.
///
/// There is nothing left to try on a channel that refuses acknowledgments: the fault is
/// surfaced to the caller, which is in charge of tearing down and re-establishing the channel.
/// The broker redelivers the message once the channel is gone.
#[derive(thiserror::Error, Debug)]
#[error("Failed to {action} message {delivery_tag}: the channel is no longer usable.")]
pub struct AckFault {
    pub delivery_tag: DeliveryTag,
    pub action: AckStrategy,
    #[source]
    pub source: anyhow::Error,
}
