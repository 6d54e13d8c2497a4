use crate::amqp::convenience::set_header;
use crate::amqp::types::AMQPValue;
use crate::consumers::recovery::DeadLetterSettings;
use crate::consumers::HandlerFault;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use serde::Serialize;
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Republishes messages that could not be processed somewhere they can be inspected later.
///
/// Used by [`RetryLimited`](super::RetryLimited) before giving up on a message.
#[async_trait::async_trait]
pub trait DeadLetterPublisher: Send + Sync + 'static {
    async fn publish(&self, fault: &HandlerFault) -> Result<(), DeadLetterError>;
}

#[derive(thiserror::Error, Debug)]
pub enum DeadLetterError {
    #[error("Failed to serialize the error envelope.")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to publish the failed message to the `{exchange}` exchange.")]
    Publish {
        exchange: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The payload published to the error exchange: the original message plus what went wrong.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub queue: &'a str,
    pub redelivered: bool,
    pub fault_kind: String,
    pub error: String,
    /// The original body. Non UTF-8 sequences are replaced.
    pub message: Cow<'a, str>,
    /// Seconds since the UNIX epoch.
    pub failed_at: u64,
}

impl<'a> ErrorEnvelope<'a> {
    pub fn new(fault: &'a HandlerFault) -> Self {
        let message = fault.message();
        let info = message.received_info();
        Self {
            exchange: &info.exchange,
            routing_key: &info.routing_key,
            queue: &info.queue,
            redelivered: info.redelivered,
            fault_kind: fault.kind().to_string(),
            error: fault.to_string(),
            message: String::from_utf8_lossy(message.body()),
            failed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Publishes an [`ErrorEnvelope`] to an error exchange for every message we give up on.
///
/// The exchange is expected to exist already: declaring topology is not our job.
pub struct ErrorExchangePublisher {
    channel: lapin::Channel,
    settings: DeadLetterSettings,
}

impl ErrorExchangePublisher {
    pub fn new(channel: lapin::Channel, settings: DeadLetterSettings) -> Self {
        Self { channel, settings }
    }

    fn properties(fault: &HandlerFault) -> BasicProperties {
        let original = fault.message().properties();
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        if let Some(message_id) = original.message_id() {
            properties = properties.with_message_id(message_id.clone());
        }
        if let Some(correlation_id) = original.correlation_id() {
            properties = properties.with_correlation_id(correlation_id.clone());
        }
        let properties = set_header(
            properties,
            "x-error-kind",
            AMQPValue::LongString(fault.kind().to_string().into()),
        );
        set_header(
            properties,
            "x-original-queue",
            AMQPValue::LongString(fault.message().received_info().queue.clone().into()),
        )
    }
}

#[async_trait::async_trait]
impl DeadLetterPublisher for ErrorExchangePublisher {
    #[tracing::instrument(
        name = "dead_letter_publish",
        skip_all,
        fields(exchange = %self.settings.exchange, delivery_tag = fault.message().delivery_tag())
    )]
    async fn publish(&self, fault: &HandlerFault) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_vec(&ErrorEnvelope::new(fault))?;
        let routing_key = self
            .settings
            .routing_key
            .as_deref()
            .unwrap_or(&fault.message().received_info().queue);

        let publish = async {
            self.channel
                .basic_publish(
                    &self.settings.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    Self::properties(fault),
                )
                .await?
                .await?;
            Ok::<_, lapin::Error>(())
        };
        publish.await.map_err(|e| DeadLetterError::Publish {
            exchange: self.settings.exchange.clone(),
            source: e.into(),
        })
    }
}
