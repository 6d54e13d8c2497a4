//! Configuration types to pick and tune an [`ErrorRecoveryStrategy`].
use crate::consumers::recovery::{
    DeadLetterPublisher, ErrorRecoveryStrategy, ImmediateReject, RetryLimited,
};
use anyhow::Context;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::sync::Arc;

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// How a consumer recovers from handler failures.
///
/// The default configuration rejects failed messages straight away, without dead lettering
/// them: it minimises surprising behaviour in production (e.g. a poisoned message going
/// round in circles).
pub struct RecoverySettings {
    /// How many times a failed message is requeued before we give up on it.
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub max_retries: u32,
    /// Whether to republish a message to the error exchange before giving up on it.
    #[serde(default)]
    pub dead_letter: bool,
}

impl RecoverySettings {
    /// Build the [`ErrorRecoveryStrategy`] described by these settings.
    ///
    /// `dead_letter_publisher` is only used (and required) if `dead_letter` is set.
    pub fn build_strategy(
        &self,
        dead_letter_publisher: Option<Arc<dyn DeadLetterPublisher>>,
    ) -> Result<Arc<dyn ErrorRecoveryStrategy>, anyhow::Error> {
        if !self.dead_letter {
            if self.max_retries == 0 {
                return Ok(Arc::new(ImmediateReject));
            }
            return Ok(Arc::new(RetryLimited::new(self.max_retries)));
        }

        let publisher = dead_letter_publisher
            .context("Dead lettering is enabled, but no dead letter publisher was provided.")?;
        Ok(Arc::new(
            RetryLimited::new(self.max_retries).with_dead_letter(publisher),
        ))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Where [`ErrorExchangePublisher`](super::ErrorExchangePublisher) sends failed messages.
pub struct DeadLetterSettings {
    /// The name of the error exchange.
    pub exchange: String,
    /// The routing key used when publishing to the error exchange.
    /// If left unspecified, it defaults to the name of the queue the message was consumed from.
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            exchange: "carrot_runner_error_exchange".into(),
            routing_key: None,
        }
    }
}
