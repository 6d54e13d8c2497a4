use crate::helpers::{message, received_info, runner, AckCall, RecordingChannel};
use carrot_runner::amqp::BasicProperties;
use carrot_runner::consumers::recovery::{ImmediateReject, RetryLimited};
use carrot_runner::consumers::{
    AckStrategy, ClosureHandler, FaultKind, HandlerInvoker, HandlerRunner, MessageContext,
    MessageReceivedInfo,
};
use fake::{Fake, Faker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Delivered = Arc<Mutex<Option<(Vec<u8>, BasicProperties, MessageReceivedInfo)>>>;

#[tokio::test]
async fn a_message_acked_by_its_handler_is_acked_exactly_once_with_its_delivery_tag() {
    // Arrange
    let delivered: Delivered = Default::default();
    let handler = ClosureHandler({
        let delivered = delivered.clone();
        move |message: Arc<MessageContext>| {
            let delivered = delivered.clone();
            async move {
                *delivered.lock().unwrap() = Some((
                    message.body().to_vec(),
                    message.properties().clone(),
                    message.received_info().clone(),
                ));
                Ok::<_, anyhow::Error>(AckStrategy::Ack)
            }
        }
    });
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(channel.clone(), handler, ImmediateReject);
    let shutdown = CancellationToken::new();
    let properties = BasicProperties::default().with_correlation_id("correlation_id".into());

    // Act
    let outcome = runner
        .process_delivery(message(42, &[], properties.clone(), &shutdown), &shutdown)
        .await
        .unwrap();

    // Assert
    assert_eq!(
        channel.calls(),
        vec![AckCall::Ack {
            delivery_tag: 42,
            multiple: false
        }]
    );
    assert!(outcome.is_success());
    assert_eq!(outcome.action(), Some(AckStrategy::Ack));

    let (body, delivered_properties, info) = delivered.lock().unwrap().take().unwrap();
    assert!(body.is_empty());
    assert_eq!(delivered_properties, properties);
    assert_eq!(info, received_info(42));
}

#[tokio::test]
async fn the_handler_chooses_how_the_message_is_acknowledged() {
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(
        channel.clone(),
        ClosureHandler(|_: Arc<MessageContext>| async {
            Ok::<_, anyhow::Error>(AckStrategy::NackWithRequeue)
        }),
        ImmediateReject,
    );
    let shutdown = CancellationToken::new();
    let body: String = Faker.fake();

    let outcome = runner
        .process_delivery(
            message(3, body.as_bytes(), BasicProperties::default(), &shutdown),
            &shutdown,
        )
        .await
        .unwrap();

    assert!(outcome.was_requeued());
    assert_eq!(
        channel.calls(),
        vec![AckCall::Nack {
            delivery_tag: 3,
            multiple: false,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn a_failing_handler_is_rejected_by_the_immediate_reject_strategy() {
    // Arrange
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(
        channel.clone(),
        ClosureHandler(|_: Arc<MessageContext>| async {
            Err::<AckStrategy, _>(std::io::Error::new(
                std::io::ErrorKind::Other,
                "downstream API unavailable",
            ))
        }),
        ImmediateReject,
    );
    let shutdown = CancellationToken::new();

    // Act
    let outcome = runner
        .process_delivery(
            message(7, b"payload", BasicProperties::default(), &shutdown),
            &shutdown,
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(
        channel.calls(),
        vec![AckCall::Reject {
            delivery_tag: 7,
            requeue: false
        }]
    );
    assert_eq!(outcome.action(), Some(AckStrategy::NackWithoutRequeue));
    let fault = outcome.fault().unwrap();
    assert_eq!(fault.kind(), FaultKind::Handler);
    // The original message is available for diagnostics.
    assert_eq!(fault.message().body(), b"payload");
    assert_eq!(fault.message().received_info(), &received_info(7));
}

#[tokio::test]
async fn a_panicking_handler_does_not_escape_the_runner() {
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(
        channel.clone(),
        ClosureHandler(|message: Arc<MessageContext>| async move {
            if message.body().is_empty() {
                panic!("Empty payload");
            }
            Ok::<_, anyhow::Error>(AckStrategy::Ack)
        }),
        ImmediateReject,
    );
    let shutdown = CancellationToken::new();

    let outcome = runner
        .process_delivery(message(5, &[], BasicProperties::default(), &shutdown), &shutdown)
        .await
        .unwrap();

    assert_eq!(outcome.fault().unwrap().kind(), FaultKind::Panicked);
    assert_eq!(
        channel.calls(),
        vec![AckCall::Reject {
            delivery_tag: 5,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn a_handler_exceeding_its_timeout_goes_through_error_recovery() {
    let channel = Arc::new(RecordingChannel::default());
    let handler = ClosureHandler(|_: Arc<MessageContext>| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, anyhow::Error>(AckStrategy::Ack)
    });
    let runner = HandlerRunner::new(
        channel.clone(),
        HandlerInvoker::new(Arc::new(handler)).with_timeout(Duration::from_millis(20)),
        Arc::new(RetryLimited::new(3)),
    );
    let shutdown = CancellationToken::new();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        runner.process_delivery(message(8, b"slow", BasicProperties::default(), &shutdown), &shutdown),
    )
    .await
    .expect("The handler timeout was not enforced")
    .unwrap();

    assert_eq!(outcome.fault().unwrap().kind(), FaultKind::TimedOut);
    assert_eq!(
        channel.calls(),
        vec![AckCall::Nack {
            delivery_tag: 8,
            multiple: false,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn a_failed_acknowledgment_is_reported_and_never_retried() {
    let channel = Arc::new(RecordingChannel::broken());
    let runner = runner(
        channel.clone(),
        ClosureHandler(|_: Arc<MessageContext>| async { Ok::<_, anyhow::Error>(AckStrategy::Ack) }),
        ImmediateReject,
    );
    let shutdown = CancellationToken::new();

    let fault = runner
        .process_delivery(message(13, &[], BasicProperties::default(), &shutdown), &shutdown)
        .await
        .unwrap_err();

    assert_eq!(fault.delivery_tag, 13);
    assert_eq!(fault.action, AckStrategy::Ack);
    assert_eq!(channel.calls().len(), 1);
}

#[tokio::test]
async fn a_failed_rejection_after_a_handler_fault_is_reported() {
    let channel = Arc::new(RecordingChannel::broken());
    let runner = runner(
        channel.clone(),
        ClosureHandler(|_: Arc<MessageContext>| async {
            Err::<AckStrategy, _>(anyhow::anyhow!("boom"))
        }),
        ImmediateReject,
    );
    let shutdown = CancellationToken::new();

    let fault = runner
        .process_delivery(message(21, &[], BasicProperties::default(), &shutdown), &shutdown)
        .await
        .unwrap_err();

    assert_eq!(fault.action, AckStrategy::NackWithoutRequeue);
    assert_eq!(
        channel.calls(),
        vec![AckCall::Reject {
            delivery_tag: 21,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn concurrent_deliveries_are_each_acknowledged_exactly_once() {
    // Arrange
    // Odd tags fail, even tags succeed, all of them yield to the runtime a few times.
    let handler = ClosureHandler(|message: Arc<MessageContext>| async move {
        let delay: u64 = (0..20).fake();
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if message.delivery_tag() % 2 == 1 {
            anyhow::bail!("odd delivery tag");
        }
        Ok(AckStrategy::Ack)
    });
    let channel = Arc::new(RecordingChannel::default());
    let runner = Arc::new(runner(channel.clone(), handler, RetryLimited::new(1)));
    let shutdown = CancellationToken::new();

    // Act
    let tasks: Vec<_> = (1..=50u64)
        .map(|delivery_tag| {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            // Distinct bodies: each message has its own retry budget.
            let body = delivery_tag.to_string();
            tokio::spawn(async move {
                runner
                    .process_delivery(
                        message(delivery_tag, body.as_bytes(), BasicProperties::default(), &shutdown),
                        &shutdown,
                    )
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Assert
    let mut calls_per_tag: HashMap<u64, Vec<AckCall>> = HashMap::new();
    for call in channel.calls() {
        calls_per_tag.entry(call.delivery_tag()).or_default().push(call);
    }
    assert_eq!(calls_per_tag.len(), 50);
    for (delivery_tag, calls) in calls_per_tag {
        let expected = if delivery_tag % 2 == 1 {
            AckCall::Nack {
                delivery_tag,
                multiple: false,
                requeue: true,
            }
        } else {
            AckCall::Ack {
                delivery_tag,
                multiple: false,
            }
        };
        assert_eq!(calls, vec![expected]);
    }
}
