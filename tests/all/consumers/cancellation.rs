//! A handler that is still running when the consumer shuts down is abandoned, not killed:
//! these tests check that shutdown is not held hostage by it, not that it stops running.
use crate::helpers::{message, runner, AckCall, RecordingChannel};
use carrot_runner::amqp::BasicProperties;
use carrot_runner::consumers::recovery::{ErrorRecoveryStrategy, ImmediateReject};
use carrot_runner::consumers::{
    AckStrategy, ClosureHandler, FaultKind, HandlerFault, MessageContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

async fn hanging(_message: Arc<MessageContext>) -> Result<AckStrategy, anyhow::Error> {
    // Ignores cancellation entirely.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(AckStrategy::Ack)
}

#[tokio::test]
async fn shutdown_abandons_a_hanging_handler_without_acknowledging_the_message() {
    // Arrange
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(channel.clone(), ClosureHandler(hanging), ImmediateReject);
    let shutdown = CancellationToken::new();

    // Act
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        }
    });
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        runner.process_delivery(message(4, &[], BasicProperties::default(), &shutdown), &shutdown),
    )
    .await
    .expect("Shutdown waited for the hanging handler")
    .unwrap();

    // Assert
    assert_eq!(outcome.action(), None);
    assert_eq!(outcome.fault().unwrap().kind(), FaultKind::Cancelled);
    assert!(channel.calls().is_empty());
}

#[tokio::test]
async fn a_cooperative_handler_is_told_to_stop_on_shutdown() {
    let (started_tx, started_rx) = oneshot::channel();
    let (stopped_tx, stopped_rx) = oneshot::channel();
    let handler = ClosureHandler({
        let signals = Arc::new(Mutex::new(Some((started_tx, stopped_tx))));
        move |message: Arc<MessageContext>| {
            let signals = signals.lock().unwrap().take();
            async move {
                let (started, stopped) = signals.expect("The handler ran more than once");
                let _ = started.send(());
                message.cancellation().cancelled().await;
                let _ = stopped.send(());
                // Wind down slowly: the consumer must not wait for us.
                std::future::pending::<()>().await;
                Ok::<_, anyhow::Error>(AckStrategy::Ack)
            }
        }
    });
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(channel.clone(), handler, ImmediateReject);
    let shutdown = CancellationToken::new();

    let processing = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            runner
                .process_delivery(message(6, &[], BasicProperties::default(), &shutdown), &shutdown)
                .await
        }
    });
    started_rx.await.unwrap();
    shutdown.cancel();
    let outcome = processing.await.unwrap().unwrap();

    assert_eq!(outcome.action(), None);
    assert!(channel.calls().is_empty());
    tokio::time::timeout(Duration::from_secs(5), stopped_rx)
        .await
        .expect("The handler never observed the cancellation")
        .unwrap();
}

#[tokio::test]
async fn handlers_are_not_started_once_shutdown_has_begun() {
    let started = Arc::new(AtomicBool::new(false));
    let handler = ClosureHandler({
        let started = started.clone();
        move |_: Arc<MessageContext>| {
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(AckStrategy::Ack)
            }
        }
    });
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(channel.clone(), handler, ImmediateReject);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let outcome = runner
        .process_delivery(message(8, &[], BasicProperties::default(), &shutdown), &shutdown)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(outcome.fault().unwrap().kind(), FaultKind::Cancelled);
    assert!(!started.load(Ordering::SeqCst));
    assert!(channel.calls().is_empty());
}

#[tokio::test]
async fn the_recovery_strategy_can_ask_for_an_acknowledgment_on_shutdown() {
    struct RequeueOnShutdown;

    #[async_trait::async_trait]
    impl ErrorRecoveryStrategy for RequeueOnShutdown {
        async fn handle_fault(
            &self,
            _message: &MessageContext,
            _fault: &HandlerFault,
        ) -> AckStrategy {
            AckStrategy::NackWithoutRequeue
        }

        async fn handle_cancellation(&self, _message: &MessageContext) -> Option<AckStrategy> {
            Some(AckStrategy::RequeueIgnoringFailure)
        }
    }

    // The channel is going away together with the consumer: the requeue attempt fails,
    // and the failure is ignored.
    let channel = Arc::new(RecordingChannel::broken());
    let runner = runner(channel.clone(), ClosureHandler(hanging), RequeueOnShutdown);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let outcome = runner
        .process_delivery(message(9, &[], BasicProperties::default(), &shutdown), &shutdown)
        .await
        .unwrap();

    assert!(outcome.was_requeued());
    assert_eq!(
        channel.calls(),
        vec![AckCall::Nack {
            delivery_tag: 9,
            multiple: false,
            requeue: true
        }]
    );
}
