use crate::amqp::AckChannel;
use crate::consumers::recovery::{ErrorRecoveryStrategy, ImmediateReject};
use crate::consumers::{
    AckFault, Handler, HandlerInvoker, HandlerRunner, MessageContext, ProcessingOutcome,
};
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::stream::{FuturesUnordered, Stream};
use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_PREFETCH_COUNT: u16 = 50;

/// A RabbitMq consumer: it pulls messages from a queue and hands each of them over to a
/// [`HandlerRunner`].
///
/// Use [`Consumer::builder`] to configure one.
///
/// # Channel ownership
///
/// The consumer does not open, recover or close channels. It is given a channel and stops
/// consuming as soon as that channel misbehaves (e.g. an acknowledgment fails): re-establishing
/// the connection is up to the caller.
pub struct Consumer {
    /// An open channel to communicate with RabbitMq.
    /// Deliveries are consumed and acknowledged on the same channel.
    channel: lapin::Channel,
    /// The name of the queue we will be consuming messages from.
    queue_name: String,
    /// The maximum number of messages `Consumer` is going to process before exiting the processing
    /// loop.
    /// The consumer will process messages indefinitely if set to `None`.
    exit_after: Option<usize>,
    /// Consumer priority. See https://www.rabbitmq.com/consumer-priority.html.
    priority: Option<i32>,
    consume_options: BasicConsumeOptions,
    runner: Arc<HandlerRunner<lapin::Channel>>,
}

impl Consumer {
    /// Start building a [`Consumer`].
    ///
    /// You need an open channel, the name of the queue you want to consume messages from and
    /// the handler that will process them.
    pub fn builder<H: Handler>(
        channel: lapin::Channel,
        queue_name: impl Into<String>,
        handler: H,
    ) -> ConsumerBuilder {
        ConsumerBuilder::new(channel, queue_name.into(), Arc::new(handler))
    }

    /// Run the consumer, which will notify RabbitMq to start pushing messages on the specified
    /// queue.
    ///
    /// Each delivery is processed in its own task, concurrently with the others, up to the
    /// prefetch count.
    ///
    /// `run_until_cancelled` exits:
    /// - if the consumer fails with an error (e.g. the channel is closed, an acknowledgment
    ///   could not be delivered);
    /// - after `exit_after` messages, if specified;
    /// - once `cancellation` fires. Handlers still running are abandoned and their messages are
    ///   left unacknowledged: RabbitMq will redeliver them.
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.queue_name))]
    pub async fn run_until_cancelled(
        self,
        cancellation: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let consumer_tag = Uuid::new_v4().to_string();
        let consumer = self
            .channel
            .basic_consume(&self.queue_name, &consumer_tag, self.consume_options, {
                let mut args = FieldTable::default();
                if let Some(priority) = self.priority {
                    args.insert("x-priority".into(), AMQPValue::LongInt(priority));
                }
                args
            })
            .await?;

        let channel = &self.channel;
        let queue_name = self.queue_name.as_str();
        let consumer_tag = consumer_tag.as_str();
        let deliveries = consumer.map(|delivery| {
            delivery.map(|delivery| {
                MessageContext::from_delivery(
                    delivery,
                    consumer_tag,
                    queue_name,
                    cancellation.child_token(),
                )
            })
        });

        consume(
            self.runner.clone(),
            deliveries,
            self.exit_after,
            &cancellation,
            move || async move {
                // Once the broker confirms the cancellation, the delivery stream runs dry.
                let _ = channel
                    .basic_cancel(consumer_tag, BasicCancelOptions::default())
                    .await;
            },
        )
        .await
    }
}

/// The consumer event loop, detached from lapin's consumer.
///
/// Each delivery is processed in its own task. The loop ends when `deliveries` runs dry,
/// after `exit_after` deliveries or at the first broken acknowledgment. `on_shutdown` is
/// called once, as soon as `cancellation` fires: it should make `deliveries` run dry.
/// In-flight tasks are always drained before returning.
async fn consume<C, S, E, F, Fut>(
    runner: Arc<HandlerRunner<C>>,
    mut deliveries: S,
    exit_after: Option<usize>,
    cancellation: &CancellationToken,
    on_shutdown: F,
) -> Result<(), anyhow::Error>
where
    C: AckChannel,
    S: Stream<Item = Result<MessageContext, E>> + Unpin,
    E: Into<anyhow::Error> + Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut in_flight = FuturesUnordered::new();
    let mut counter = 0;
    let mut on_shutdown = Some(on_shutdown);

    let result = 'event_loop: loop {
        // have we consumed all the events we want?
        if exit_after == Some(counter) {
            break 'event_loop Ok(());
        }

        tokio::select! {
            // we want to poll in the specified order - preferring the handling of shutdowns before
            // going on with processing more events
            biased;

            _ = cancellation.cancelled(), if on_shutdown.is_some() => {
                tracing::info!("consumer received shutdown event");
                if let Some(on_shutdown) = on_shutdown.take() {
                    on_shutdown().await;
                }
            }

            // clear out completed tasks, stopping at the first broken acknowledgment
            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                if let Err(e) = check_outcome(outcome) {
                    break 'event_loop Err(e);
                }
            }

            event = deliveries.next() => {
                match event {
                    // consumer has shutdown
                    None => { break 'event_loop Ok(()) }
                    Some(Err(e)) => {
                        tracing::error!("Consumer error: {}", e);
                        break 'event_loop Err(e.into())
                    }
                    Some(Ok(message)) => {
                        let runner = runner.clone();
                        let cancellation = cancellation.clone();
                        in_flight.push(tokio::spawn(async move {
                            runner.process_delivery(message, &cancellation).await
                        }));
                        counter += 1;
                    }
                }
            }
        }
    };

    // Make sure all tasks in flight complete before returning.
    // If the set is empty, this returns immediately.
    while let Some(outcome) = in_flight.next().await {
        if let Err(e) = check_outcome(outcome) {
            tracing::error!(error = %e, "Acknowledgment failed while draining in-flight messages.");
        }
    }

    result
}

/// A broken acknowledgment means a broken channel: we must stop consuming.
fn check_outcome(
    outcome: Result<Result<ProcessingOutcome, AckFault>, JoinError>,
) -> Result<(), anyhow::Error> {
    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            tracing::error!(error = %e, "Message processing task failed.");
            Ok(())
        }
    }
}

/// A builder to compose a [`Consumer`] with a fluent API.
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder {
    channel: lapin::Channel,
    queue_name: String,
    handler: Arc<dyn Handler>,
    prefetch_count: u16,
    priority: Option<i32>,
    exit_after: Option<usize>,
    handler_timeout: Option<Duration>,
    error_strategy: Arc<dyn ErrorRecoveryStrategy>,
    consume_options: BasicConsumeOptions,
}

impl ConsumerBuilder {
    fn new(channel: lapin::Channel, queue_name: String, handler: Arc<dyn Handler>) -> Self {
        Self {
            channel,
            queue_name,
            handler,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            priority: None,
            // By default, the consumer will continue to consume message indefinitely.
            exit_after: None,
            handler_timeout: None,
            // We default to never requeueing a failed message.
            // It minimises surprising behaviour/phenomena in production.
            error_strategy: Arc::new(ImmediateReject),
            consume_options: BasicConsumeOptions::default(),
        }
    }

    /// Configure the prefetch count of the consumer - how many messages can be in flight at
    /// the same time.
    /// If not configured, the prefetch count is set to a default value of 50.
    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Set the consumer priority. See https://www.rabbitmq.com/consumer-priority.html.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Stop consuming after `n` messages. Mostly useful in tests.
    #[must_use]
    pub fn exit_after(mut self, n: usize) -> Self {
        self.exit_after = Some(n);
        self
    }

    /// Abandon handlers that take longer than `timeout` to complete.
    /// Timed-out messages go through the error recovery strategy.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Specify what happens to messages whose handler failed.
    ///
    /// If not configured, failed messages are rejected straight away (see [`ImmediateReject`]).
    #[must_use]
    pub fn with_error_strategy<S: ErrorRecoveryStrategy>(self, strategy: S) -> Self {
        self.with_dyn_error_strategy(Arc::new(strategy))
    }

    /// See [`ConsumerBuilder::with_error_strategy`].
    #[must_use]
    pub fn with_dyn_error_strategy(mut self, strategy: Arc<dyn ErrorRecoveryStrategy>) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// To configure the consume options for the consumer
    #[must_use]
    pub fn with_consume_options(mut self, consume_options: BasicConsumeOptions) -> Self {
        self.consume_options = consume_options;
        self
    }

    /// Apply the prefetch count to the channel and return a ready-to-run [`Consumer`].
    ///
    /// `build` does NOT trigger consumption of messages!
    /// Check out [`Consumer::run_until_cancelled`].
    #[tracing::instrument(skip_all, name = "consumer_new", fields(queue_name = %self.queue_name))]
    pub async fn build(self) -> Result<Consumer, anyhow::Error> {
        self.channel
            .basic_qos(self.prefetch_count, BasicQosOptions { global: false })
            .await?;

        let mut invoker = HandlerInvoker::new(self.handler);
        if let Some(timeout) = self.handler_timeout {
            invoker = invoker.with_timeout(timeout);
        }
        let runner = HandlerRunner::new(self.channel.clone(), invoker, self.error_strategy);

        Ok(Consumer {
            channel: self.channel,
            queue_name: self.queue_name,
            exit_after: self.exit_after,
            priority: self.priority,
            consume_options: self.consume_options,
            runner: Arc::new(runner),
        })
    }
}
