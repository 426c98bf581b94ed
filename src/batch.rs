// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batch Accumulation
//!
//! Buffers decoded deliveries of one consumer until the window holds
//! `batch_size` messages or `batch_timeout` elapsed since its first message,
//! then hands the whole window to the batch handler in delivery order.
//!
//! The accumulator is owned by the consumer's loop task and flushed inline,
//! so a new window only starts filling after the previous flush settled all
//! of its deliveries.

use crate::{
    broker::Delivery,
    consumer::{panic_message, ConsumerRuntime},
    errors::{AmqpError, HandlerError},
    handler::{BatchConsumerHandler, ConsumerMessage},
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, panic::AssertUnwindSafe, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error};

/// Default time a window waits for more messages
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// The open window of one consumer.
pub(crate) struct BatchAccumulator {
    batch_size: usize,
    batch_timeout: Duration,
    window: Vec<(Delivery, ConsumerMessage)>,
    deadline: Option<Instant>,
}

impl BatchAccumulator {
    pub(crate) fn new(batch_size: usize, batch_timeout: Duration) -> BatchAccumulator {
        BatchAccumulator {
            batch_size: batch_size.max(1),
            batch_timeout,
            window: Vec::with_capacity(batch_size),
            deadline: None,
        }
    }

    /// Appends a message to the window, starting the window's timer on its
    /// first message.
    ///
    /// # Returns
    /// true when the window reached the batch size and must be flushed
    pub(crate) fn offer(&mut self, delivery: Delivery, msg: ConsumerMessage) -> bool {
        if self.window.is_empty() {
            self.deadline = Some(Instant::now() + self.batch_timeout);
        }

        self.window.push((delivery, msg));
        self.window.len() >= self.batch_size
    }

    /// When the open window times out, `None` without an open window.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn len(&self) -> usize {
        self.window.len()
    }

    /// Closes the window and returns its messages.
    pub(crate) fn take(&mut self) -> Vec<(Delivery, ConsumerMessage)> {
        self.deadline = None;
        std::mem::replace(&mut self.window, Vec::with_capacity(self.batch_size))
    }
}

/// Runs the batch handler over one window and settles every delivery in it.
///
/// Success acks the deliveries in order. Failure hands each delivery to the
/// retry coordinator on its own, so every message keeps its own retry count.
pub(crate) async fn flush(
    tracer: &BoxedTracer,
    runtime: &ConsumerRuntime,
    handler: &dyn BatchConsumerHandler,
    batch: Vec<(Delivery, ConsumerMessage)>,
) -> Result<(), AmqpError> {
    let Some((first, _)) = batch.first() else {
        return Ok(());
    };

    let (ctx, mut span) = otel::new_span(&first.properties, tracer, &runtime.name);
    let (deliveries, msgs): (Vec<_>, Vec<_>) = batch.into_iter().unzip();

    debug!(consumer = %runtime.name, size = msgs.len(), "flushing batch");

    let result = run(&ctx, handler, &msgs).await;

    let mut settled = Ok(());
    match result {
        Ok(()) => {
            for delivery in &deliveries {
                if let Err(err) = runtime.ack(delivery).await {
                    span.record_error(&err);
                    settled = Err(err);
                }
            }

            if settled.is_ok() {
                span.set_status(Status::Ok);
            } else {
                span.set_status(Status::Error {
                    description: Cow::from("error to ack batch"),
                });
            }
        }
        Err(failure) => {
            error!(
                consumer = %runtime.name,
                size = deliveries.len(),
                error = failure.message(),
                "batch handler failed"
            );
            span.record_error(&failure);
            span.set_status(Status::Error {
                description: Cow::from(failure.to_string()),
            });

            for delivery in &deliveries {
                if let Err(err) = runtime.retry.handle_failure(delivery, &failure).await {
                    error!(error = err.to_string(), consumer = %runtime.name, "failure to settle failed msg");
                    settled = Err(err);
                }
            }
        }
    }

    settled
}

async fn run(
    ctx: &Context,
    handler: &dyn BatchConsumerHandler,
    msgs: &[ConsumerMessage],
) -> Result<(), HandlerError> {
    AssertUnwindSafe(handler.exec(ctx, msgs))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::retryable(panic_message(panic))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        contract::{ConsumerDefinition, MessageDefinition},
        handler::MockBatchConsumerHandler,
        queue::QueueDefinition,
        schema::AnyObject,
    };
    use lapin::BasicProperties;
    use mockall::{predicate::eq, Sequence};
    use serde_json::json;
    use std::sync::Arc;

    fn entry(tag: u64) -> (Delivery, ConsumerMessage) {
        let delivery = Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: "orders".to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: b"{}".to_vec(),
        };
        let msg = ConsumerMessage {
            consumer: "orders".to_owned(),
            queue: "orders".to_owned(),
            routing_key: "orders".to_owned(),
            message_id: None,
            redelivered: false,
            payload: json!({ "n": tag }),
            headers: json!({}),
        };
        (delivery, msg)
    }

    fn runtime(channel: MockBrokerChannel) -> ConsumerRuntime {
        ConsumerRuntime::new(
            "orders",
            ConsumerDefinition::new(&QueueDefinition::classic("orders"), MessageDefinition::new(AnyObject)),
            Arc::new(channel),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn window_fills_up_to_the_batch_size() {
        let mut acc = BatchAccumulator::new(3, Duration::from_millis(500));
        assert_eq!(acc.deadline(), None);

        let (d, m) = entry(1);
        assert!(!acc.offer(d, m));
        let deadline = acc.deadline().unwrap();
        assert_eq!(deadline, Instant::now() + Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(100)).await;
        let (d, m) = entry(2);
        assert!(!acc.offer(d, m));
        assert_eq!(acc.deadline(), Some(deadline));

        let (d, m) = entry(3);
        assert!(acc.offer(d, m));

        let batch = acc.take();
        assert_eq!(
            batch.iter().map(|(d, _)| d.delivery_tag).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(acc.len(), 0);
        assert_eq!(acc.deadline(), None);
    }

    #[tokio::test]
    async fn successful_batch_acks_in_order() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();
        for tag in 1..=3 {
            channel
                .expect_ack()
                .with(eq(tag))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let mut handler = MockBatchConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msgs| {
                msgs.iter().map(|m| m.payload["n"].clone()).collect::<Vec<_>>()
                    == vec![json!(1), json!(2), json!(3)]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let batch = (1..=3).map(entry).collect();
        flush(&otel::tracer(), &runtime(channel), &handler, batch)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_batch_settles_every_delivery() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_ack().never();
        channel
            .expect_nack()
            .with(mockall::predicate::in_iter(vec![1u64, 2]), eq(true))
            .times(2)
            .returning(|_, _| Ok(()));

        let mut handler = MockBatchConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(HandlerError::retryable("db down")));

        let batch = (1..=2).map(entry).collect();
        flush(&otel::tracer(), &runtime(channel), &handler, batch)
            .await
            .unwrap();
    }
}
