// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the per-delivery part of consuming: decoding a
//! delivery (content-encoding, JSON, payload and headers schemas), running the
//! handler, and settling the delivery. Handler success acks, handler failure
//! goes through the queue's `RetryCoordinator`. A delivery that cannot be
//! decoded is nacked without requeue, since it would fail the same way again.

use crate::{
    broker::{BrokerChannel, Delivery},
    compression,
    contract::ConsumerDefinition,
    errors::{AmqpError, HandlerError, ValidationError},
    handler::{ConsumerHandler, ConsumerMessage},
    headers, otel,
    retry::RetryCoordinator,
    schema::SchemaIssue,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tracing::{debug, error};

/// Why a delivery could not be turned into a `ConsumerMessage`.
#[derive(Error, Debug)]
pub(crate) enum DecodeError {
    #[error(transparent)]
    Encoding(#[from] AmqpError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Everything one consumer needs to settle its deliveries.
pub(crate) struct ConsumerRuntime {
    pub(crate) name: String,
    pub(crate) definition: ConsumerDefinition,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) retry: RetryCoordinator,
}

impl ConsumerRuntime {
    pub(crate) fn new(name: &str, definition: ConsumerDefinition, channel: Arc<dyn BrokerChannel>) -> ConsumerRuntime {
        let retry = RetryCoordinator::new(channel.clone(), definition.queue());
        ConsumerRuntime {
            name: name.to_owned(),
            definition,
            channel,
            retry,
        }
    }

    pub(crate) fn queue(&self) -> &str {
        self.definition.queue().name()
    }

    /// Decompresses, parses and validates a delivery.
    pub(crate) fn decode(&self, delivery: &Delivery) -> Result<ConsumerMessage, DecodeError> {
        let encoding = delivery
            .properties
            .content_encoding()
            .as_ref()
            .map(|e| e.as_str());
        let body = compression::decode_body(encoding, &delivery.data)?;

        let payload: Value = serde_json::from_slice(&body).map_err(|err| ValidationError {
            source_name: self.name.clone(),
            issues: vec![SchemaIssue::new("", format!("invalid JSON: {}", err))],
        })?;

        let message = self.definition.message();
        message
            .payload_schema()
            .validate(&payload)
            .map_err(|issues| ValidationError {
                source_name: self.name.clone(),
                issues,
            })?;

        let headers = headers::table_to_json(&delivery.properties.headers().clone().unwrap_or_default());
        if let Some(schema) = message.headers_schema() {
            schema.validate(&headers).map_err(|issues| ValidationError {
                source_name: self.name.clone(),
                issues,
            })?;
        }

        Ok(ConsumerMessage {
            consumer: self.name.clone(),
            queue: self.queue().to_owned(),
            routing_key: delivery.routing_key.clone(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string()),
            redelivered: delivery.redelivered,
            payload,
            headers,
        })
    }

    /// Removes an undecodable delivery from the queue.
    pub(crate) async fn reject(&self, delivery: &Delivery, reason: &DecodeError) -> Result<(), AmqpError> {
        error!(
            consumer = %self.name,
            queue = self.queue(),
            error = reason.to_string(),
            "removing message from queue - reason: unprocessable msg"
        );

        self.channel
            .nack(delivery.delivery_tag, false)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error whiling nack msg"))
    }

    pub(crate) async fn ack(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        self.channel
            .ack(delivery.delivery_tag)
            .await
            .inspect_err(|err| error!(error = err.to_string(), queue = self.queue(), "error whiling ack msg"))
    }
}

/// Failure message of a panicking handler.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_owned()
    }
}

/// Consumes and processes one delivery in single-message mode.
///
/// # Returns
/// Ok(()) once the delivery was settled, or the broker error that prevented it
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    runtime: &ConsumerRuntime,
    handler: &dyn ConsumerHandler,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &runtime.name);

    debug!(
        consumer = %runtime.name,
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        "received msg"
    );

    let msg = match runtime.decode(&delivery) {
        Ok(msg) => msg,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("unprocessable msg"),
            });
            return runtime.reject(&delivery, &err).await;
        }
    };

    let result = AssertUnwindSafe(handler.exec(&ctx, &msg))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::retryable(panic_message(panic))));

    match result {
        Ok(()) => {
            debug!(consumer = %runtime.name, "message successfully processed");
            match runtime.ack(&delivery).await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
            }
        }
        Err(failure) => {
            span.record_error(&failure);
            span.set_status(Status::Error {
                description: Cow::from(failure.to_string()),
            });

            runtime.retry.handle_failure(&delivery, &failure).await.map(|outcome| {
                debug!(consumer = %runtime.name, ?outcome, "failed msg settled");
            })
        }
    }
}
