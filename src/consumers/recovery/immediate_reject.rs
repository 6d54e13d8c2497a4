use crate::consumers::recovery::ErrorRecoveryStrategy;
use crate::consumers::{AckStrategy, HandlerFault, MessageContext};

/// Never requeue a message whose handler failed.
///
/// The message is rejected: it ends up in the dead letter exchange, if the queue has one,
/// or it is discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateReject;

#[async_trait::async_trait]
impl ErrorRecoveryStrategy for ImmediateReject {
    async fn handle_fault(&self, message: &MessageContext, fault: &HandlerFault) -> AckStrategy {
        tracing::warn!(
            error = %fault,
            delivery_tag = message.delivery_tag(),
            "Rejecting message after a processing failure."
        );
        AckStrategy::NackWithoutRequeue
    }
}
