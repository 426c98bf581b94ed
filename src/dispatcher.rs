// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs one consumer of a topology: it sets the channel prefetch,
//! subscribes to the consumer's queue and dispatches every delivery to the
//! registered handler, either one message at a time or through a
//! `BatchAccumulator`.
//!
//! Prefetch is the only backpressure: the broker stops delivering once that
//! many deliveries are unacknowledged, nothing else is queued in process.
//! Per-message failures are logged and never stop the loop. The loop stops
//! when the pipeline is closed or when the broker cancels the subscription
//! (null delivery).

use crate::{
    batch::{self, BatchAccumulator, DEFAULT_BATCH_TIMEOUT},
    broker::{BrokerChannel, DeliveryStream},
    consumer::{self, ConsumerRuntime},
    contract::TopologyDescription,
    errors::AmqpError,
    handler::{BatchConsumerHandler, ConsumerHandler, Handler},
    otel,
};
use futures_util::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How a consumer pulls and groups its deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Maximum unacknowledged deliveries on the consumer's channel
    pub prefetch: Option<u16>,
    /// Enables batching with this many messages per batch
    pub batch_size: Option<usize>,
    /// How long a batch waits to fill up, 1s by default
    pub batch_timeout: Option<Duration>,
}

impl ConsumerOptions {
    pub fn new() -> ConsumerOptions {
        ConsumerOptions::default()
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// The explicit prefetch, or the batch size when batching.
    pub(crate) fn effective_prefetch(&self) -> Option<u16> {
        self.prefetch.or_else(|| {
            self.batch_size
                .map(|size| u16::try_from(size).unwrap_or(u16::MAX))
        })
    }
}

/// A running consumer.
pub struct ConsumePipeline {
    name: String,
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ConsumePipeline {
    /// Starts consuming for the named consumer of `topology`.
    ///
    /// The pipeline owns `channel` from now on and closes it on `close`, or
    /// right away when the subscription cannot be set up.
    pub async fn start(
        channel: Arc<dyn BrokerChannel>,
        topology: &TopologyDescription,
        consumer: &str,
        handler: Handler,
        options: ConsumerOptions,
    ) -> Result<ConsumePipeline, AmqpError> {
        let Some(def) = topology.get_consumer(consumer) else {
            error!(consumer, "unknown consumer");
            discard(channel.as_ref(), consumer).await;
            return Err(AmqpError::UnknownConsumer(consumer.to_owned()));
        };

        let queue = def.queue().name().to_owned();

        if let Handler::Batch(_) = handler {
            let size = options.batch_size.unwrap_or(1);
            if options.effective_prefetch().is_some_and(|p| (p as usize) < size) {
                warn!(
                    consumer,
                    queue = %queue,
                    "prefetch is smaller than the batch size, batches will only flush on timeout"
                );
            }
        }

        let consumer_tag = format!("{}-{}", consumer, Uuid::new_v4());
        let subscribed = async {
            if let Some(prefetch) = options.effective_prefetch() {
                debug!(consumer, prefetch, "configuring qos");
                channel.qos(prefetch).await?;
            }
            channel.consume(&queue, &consumer_tag).await
        };

        let deliveries = match subscribed.await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), consumer, queue = %queue, "failure to subscribe");
                discard(channel.as_ref(), consumer).await;
                return Err(err);
            }
        };

        let runtime = Arc::new(ConsumerRuntime::new(consumer, def.clone(), channel.clone()));
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let running = Arc::new(AtomicBool::new(true));

        let worker = ConsumerLoop {
            runtime,
            deliveries,
            cancel: cancel.clone(),
            tasks: tasks.clone(),
            running: running.clone(),
        };

        match handler {
            Handler::Single(handler) => {
                tasks.spawn(worker.run_single(handler));
            }
            Handler::Batch(handler) => {
                let size = options.batch_size.unwrap_or(1);
                let window = options.batch_timeout.unwrap_or(DEFAULT_BATCH_TIMEOUT);
                tasks.spawn(worker.run_batch(handler, BatchAccumulator::new(size, window)));
            }
        }

        debug!(consumer, queue = %queue, "consumer started");

        Ok(ConsumePipeline {
            name: consumer.to_owned(),
            queue,
            consumer_tag,
            channel,
            cancel,
            tasks,
            running,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consume loop is still receiving deliveries.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops receiving, lets in-flight handlers finish, then closes the channel.
    ///
    /// With a `drain` deadline, handlers still running when it elapses are
    /// left behind and their deliveries are requeued by the broker when the
    /// channel closes. Closing twice is a no-op.
    pub async fn close(&self, drain: Option<Duration>) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(consumer = %self.name, "closing consumer...");
        self.cancel.cancel();
        if let Err(err) = self.channel.cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), consumer = %self.name, "failure to cancel the subscription");
        }

        self.tasks.close();
        match drain {
            Some(deadline) => {
                if timeout(deadline, self.tasks.wait()).await.is_err() {
                    warn!(
                        consumer = %self.name,
                        in_flight = self.tasks.len(),
                        "drain deadline elapsed with handlers in flight"
                    );
                }
            }
            None => self.tasks.wait().await,
        }

        self.channel.close().await?;
        debug!(consumer = %self.name, "consumer closed");
        Ok(())
    }
}

struct ConsumerLoop {
    runtime: Arc<ConsumerRuntime>,
    deliveries: DeliveryStream,
    cancel: CancellationToken,
    tasks: TaskTracker,
    running: Arc<AtomicBool>,
}

impl ConsumerLoop {
    fn stopped_by_broker(&self) {
        warn!(
            consumer = %self.runtime.name,
            queue = self.runtime.queue(),
            "consumer was cancelled by the broker"
        );
    }

    async fn run_single(mut self, handler: Arc<dyn ConsumerHandler>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.deliveries.next() => next,
            };

            match next {
                Some(Ok(Some(delivery))) => {
                    let runtime = self.runtime.clone();
                    let handler = handler.clone();
                    self.tasks.spawn(async move {
                        if let Err(err) =
                            consumer::consume(&otel::tracer(), &runtime, handler.as_ref(), delivery).await
                        {
                            error!(error = err.to_string(), consumer = %runtime.name, "error consume msg");
                        }
                    });
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), consumer = %self.runtime.name, "errors consume msg")
                }
                Some(Ok(None)) | None => {
                    self.stopped_by_broker();
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_batch(mut self, handler: Arc<dyn BatchConsumerHandler>, mut acc: BatchAccumulator) {
        enum Event {
            Stop,
            Timeout,
            Next(Option<Result<Option<crate::broker::Delivery>, AmqpError>>),
        }

        let tracer = otel::tracer();

        loop {
            let deadline = acc.deadline();
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Stop,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Event::Timeout,
                next = self.deliveries.next() => Event::Next(next),
            };

            match event {
                Event::Stop => {
                    if acc.len() > 0 {
                        flush_window(&tracer, &self.runtime, handler.as_ref(), &mut acc).await;
                    }
                    break;
                }
                Event::Timeout => {
                    debug!(consumer = %self.runtime.name, size = acc.len(), "batch timeout");
                    flush_window(&tracer, &self.runtime, handler.as_ref(), &mut acc).await;
                }
                Event::Next(Some(Ok(Some(delivery)))) => match self.runtime.decode(&delivery) {
                    Ok(msg) => {
                        if acc.offer(delivery, msg) {
                            flush_window(&tracer, &self.runtime, handler.as_ref(), &mut acc).await;
                        }
                    }
                    Err(reason) => {
                        if let Err(err) = self.runtime.reject(&delivery, &reason).await {
                            error!(error = err.to_string(), consumer = %self.runtime.name, "error consume msg");
                        }
                    }
                },
                Event::Next(Some(Err(err))) => {
                    error!(error = err.to_string(), consumer = %self.runtime.name, "errors consume msg")
                }
                Event::Next(Some(Ok(None))) | Event::Next(None) => {
                    self.stopped_by_broker();
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

async fn discard(channel: &dyn BrokerChannel, consumer: &str) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), consumer, "failure to close the consumer channel");
    }
}

/// Hands the open window to `handler` and settles it. Takes the runtime
/// rather than the loop, whose delivery stream is not `Sync`.
async fn flush_window(
    tracer: &opentelemetry::global::BoxedTracer,
    runtime: &ConsumerRuntime,
    handler: &dyn BatchConsumerHandler,
    acc: &mut BatchAccumulator,
) {
    if let Err(err) = batch::flush(tracer, runtime, handler, acc.take()).await {
        error!(error = err.to_string(), consumer = %runtime.name, "error settling batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Delivery, MockBrokerChannel},
        contract::{ConsumerDefinition, MessageDefinition},
        errors::HandlerError,
        handler::handler_fn,
        queue::QueueDefinition,
        schema::AnyObject,
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use mockall::predicate::eq;

    fn topology() -> TopologyDescription {
        let orders = QueueDefinition::classic("orders");
        TopologyDescription::new()
            .queue("orders", orders.clone())
            .consumer("orders", ConsumerDefinition::new(&orders, MessageDefinition::new(AnyObject)))
    }

    #[test]
    fn batching_defaults_prefetch_to_the_batch_size() {
        assert_eq!(ConsumerOptions::new().effective_prefetch(), None);
        assert_eq!(ConsumerOptions::new().batch_size(5).effective_prefetch(), Some(5));
        assert_eq!(
            ConsumerOptions::new().batch_size(5).prefetch(20).effective_prefetch(),
            Some(20)
        );
    }

    #[tokio::test]
    async fn unknown_consumer_is_rejected() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_close().times(1).returning(|| Ok(()));

        let result = ConsumePipeline::start(
            Arc::new(channel),
            &topology(),
            "missing",
            handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            ConsumerOptions::new(),
        )
        .await;

        assert!(matches!(result, Err(AmqpError::UnknownConsumer(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn failed_qos_closes_the_channel() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_qos()
            .times(1)
            .returning(|_| Err(AmqpError::QoSDeclarationError("channel blocked".to_owned())));
        channel.expect_consume().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let result = ConsumePipeline::start(
            Arc::new(channel),
            &topology(),
            "orders",
            handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            ConsumerOptions::new().prefetch(10),
        )
        .await;

        assert!(matches!(result, Err(AmqpError::QoSDeclarationError(_))));
    }

    #[tokio::test]
    async fn failed_subscription_closes_the_channel_even_when_close_fails() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_qos().never();
        channel
            .expect_consume()
            .times(1)
            .returning(|queue, _| Err(AmqpError::ConsumerDeclarationError(queue.to_owned(), "NOT_FOUND".to_owned())));
        channel
            .expect_close()
            .times(1)
            .returning(|| Err(AmqpError::ChannelError("already closed".to_owned())));

        let result = ConsumePipeline::start(
            Arc::new(channel),
            &topology(),
            "orders",
            handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            ConsumerOptions::new(),
        )
        .await;

        assert!(matches!(result, Err(AmqpError::ConsumerDeclarationError(queue, _)) if queue == "orders"));
    }

    #[tokio::test]
    async fn sets_qos_before_subscribing_and_stops_on_null_delivery() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = mockall::Sequence::new();
        channel
            .expect_qos()
            .with(eq(10))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .withf(|queue, _| queue == "orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let delivery = Delivery {
                    delivery_tag: 1,
                    exchange: String::new(),
                    routing_key: "orders".to_owned(),
                    redelivered: false,
                    properties: BasicProperties::default(),
                    data: b"{}".to_vec(),
                };
                Ok(stream::iter(vec![Ok(Some(delivery)), Ok(None)]).boxed())
            });
        channel.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        channel.expect_cancel().returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let pipeline = ConsumePipeline::start(
            Arc::new(channel),
            &topology(),
            "orders",
            handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            ConsumerOptions::new().prefetch(10),
        )
        .await
        .unwrap();

        while pipeline.is_running() {
            tokio::task::yield_now().await;
        }

        pipeline.close(None).await.unwrap();
        pipeline.close(None).await.unwrap();
    }
}
