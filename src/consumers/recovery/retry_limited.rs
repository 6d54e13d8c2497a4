use crate::amqp::BasicPropertiesExt;
use crate::consumers::recovery::{DeadLetterPublisher, ErrorRecoveryStrategy};
use crate::consumers::{AckStrategy, HandlerFault, MessageContext};
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

/// Header set by RabbitMq on quorum queues: how many times the message has been delivered
/// before.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// How many failing messages a [`RetryLimited`] keeps track of by default.
pub const DEFAULT_TRACKED_MESSAGES: usize = 10_000;

/// Requeue a failed message up to `max_retries` times, then give up on it.
///
/// # Counting attempts
///
/// A requeued message comes back with a new delivery tag, so failures are counted per message:
///
/// - by `message_id`, if the publisher set one;
/// - by content (exchange, routing key, queue and body) otherwise.
///
/// A count only carries over to deliveries flagged as `redelivered` by the broker. A first
/// delivery always starts from zero, so a new message never inherits the failures of another
/// message with the same id or the same content.
///
/// Failing messages may never come back to this consumer (they get redelivered to a competing
/// consumer, they expire, the queue is purged), so only a bounded number of recently failed
/// messages is remembered (see [`RetryLimited::with_tracked_messages`]): the least recently
/// failed one is forgotten to make room.
///
/// If the broker reports how many times the message was delivered (`x-delivery-count`, set on
/// quorum queues), the larger of the two counts wins. That keeps the limit meaningful across
/// consumer restarts.
///
/// With `max_retries = N`, the first `N` failures of a message requeue it and failure `N + 1`
/// rejects it. `max_retries = 0` behaves like [`ImmediateReject`](super::ImmediateReject).
///
/// # Dead lettering
///
/// When a [`DeadLetterPublisher`] is configured, a message is republished through it before
/// being rejected. If republishing fails, the message is requeued instead: we'd rather see it
/// again than lose it.
///
/// There is no backoff between attempts. While the error exchange is unreachable, an exhausted
/// message goes around the queue as fast as the broker redelivers it, with a dead lettering
/// attempt (and an error log) on every round. Alert on those logs, or wrap the publisher with
/// your own fallback policy.
pub struct RetryLimited {
    max_retries: u32,
    dead_letter: Option<Arc<dyn DeadLetterPublisher>>,
    failures: Mutex<LruCache<MessageKey, u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MessageKey {
    MessageId(String),
    Fingerprint(u64),
}

impl MessageKey {
    fn of(message: &MessageContext) -> Self {
        if let Some(message_id) = message.properties().message_id() {
            return Self::MessageId(message_id.to_string());
        }
        let info = message.received_info();
        let mut hasher = DefaultHasher::new();
        info.exchange.hash(&mut hasher);
        info.routing_key.hash(&mut hasher);
        info.queue.hash(&mut hasher);
        message.body().hash(&mut hasher);
        Self::Fingerprint(hasher.finish())
    }
}

impl RetryLimited {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            dead_letter: None,
            failures: Mutex::new(LruCache::new(capacity(DEFAULT_TRACKED_MESSAGES))),
        }
    }

    /// Remember at most `tracked_messages` failing messages at a time (at least one).
    ///
    /// Defaults to [`DEFAULT_TRACKED_MESSAGES`].
    #[must_use]
    pub fn with_tracked_messages(self, tracked_messages: usize) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(capacity(tracked_messages));
        self
    }

    /// Republish messages through `publisher` before rejecting them.
    #[must_use]
    pub fn with_dead_letter(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// How many failing messages are currently being tracked.
    pub fn tracked_messages(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record a new failure for `message` and return how many times it has failed so far,
    /// this failure included.
    fn record_failure(&self, message: &MessageContext) -> u32 {
        let key = MessageKey::of(message);
        let broker_count = message
            .properties()
            .get_header_u64(DELIVERY_COUNT_HEADER)
            .map(|previous| u32::try_from(previous).unwrap_or(u32::MAX).saturating_add(1))
            .unwrap_or(1);

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = if message.received_info().redelivered {
            failures.get(&key).copied().unwrap_or(0)
        } else {
            0
        };
        let count = previous.saturating_add(1).max(broker_count);
        failures.put(key, count);
        count
    }

    fn forget(&self, message: &MessageContext) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(&MessageKey::of(message));
    }
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

#[async_trait::async_trait]
impl ErrorRecoveryStrategy for RetryLimited {
    async fn handle_fault(&self, message: &MessageContext, fault: &HandlerFault) -> AckStrategy {
        let failures = self.record_failure(message);
        let delivery_tag = message.delivery_tag();

        if failures <= self.max_retries {
            tracing::warn!(
                error = %fault,
                delivery_tag,
                failures,
                max_retries = self.max_retries,
                "Requeueing message after a processing failure."
            );
            return AckStrategy::NackWithRequeue;
        }

        if let Some(publisher) = &self.dead_letter {
            if let Err(e) = publisher.publish(fault).await {
                tracing::error!(
                    error = %e,
                    delivery_tag,
                    failures,
                    "Failed to dead letter message, requeueing it."
                );
                return AckStrategy::NackWithRequeue;
            }
        }

        tracing::warn!(
            error = %fault,
            delivery_tag,
            failures,
            max_retries = self.max_retries,
            "Giving up on message after too many processing failures."
        );
        self.forget(message);
        AckStrategy::NackWithoutRequeue
    }

    async fn handle_completion(&self, message: &MessageContext) {
        self.forget(message);
    }
}
