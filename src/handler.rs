// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! What a worker runs for each decoded message (`ConsumerHandler`) or for each
//! flushed batch (`BatchConsumerHandler`). Handlers report failures as
//! `HandlerError`, which decides whether the retry budget is consumed.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, sync::Arc};

/// A delivery that passed decoding and schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub consumer: String,
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub payload: Value,
    /// Message headers as a JSON object
    pub headers: Value,
}

impl ConsumerMessage {
    /// Deserializes the payload. The payload was validated already, so a
    /// mismatch here is a handler bug and will not improve on retry.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        T::deserialize(&self.payload).map_err(HandlerError::non_retryable)
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }
}

/// Handles one message at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Handles a flushed batch, in delivery order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msgs: &[ConsumerMessage]) -> Result<(), HandlerError>;
}

/// A handler registered for one consumer.
#[derive(Clone)]
pub enum Handler {
    Single(Arc<dyn ConsumerHandler>),
    Batch(Arc<dyn BatchConsumerHandler>),
}

impl From<Arc<dyn ConsumerHandler>> for Handler {
    fn from(handler: Arc<dyn ConsumerHandler>) -> Self {
        Handler::Single(handler)
    }
}

impl From<Arc<dyn BatchConsumerHandler>> for Handler {
    fn from(handler: Arc<dyn BatchConsumerHandler>) -> Self {
        Handler::Batch(handler)
    }
}

/// `ConsumerHandler` backed by an async closure.
pub struct ClosureHandler<F> {
    closure: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for ClosureHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.closure)(msg.clone()).await
    }
}

/// `BatchConsumerHandler` backed by an async closure.
pub struct BatchClosureHandler<F> {
    closure: F,
}

#[async_trait]
impl<F, Fut> BatchConsumerHandler for BatchClosureHandler<F>
where
    F: Fn(Vec<ConsumerMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msgs: &[ConsumerMessage]) -> Result<(), HandlerError> {
        (self.closure)(msgs.to_vec()).await
    }
}

/// Wraps an async closure as a single-message handler.
///
/// ```no_run
/// use amqp_core::{errors::HandlerError, handler::handler_fn};
///
/// let handler = handler_fn(|msg| async move {
///     println!("{}", msg.payload);
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut>(closure: F) -> Handler
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Handler::Single(Arc::new(ClosureHandler { closure }))
}

/// Wraps an async closure as a batch handler.
pub fn batch_handler_fn<F, Fut>(closure: F) -> Handler
where
    F: Fn(Vec<ConsumerMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Handler::Batch(Arc::new(BatchClosureHandler { closure }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: String,
    }

    fn message(payload: Value) -> ConsumerMessage {
        ConsumerMessage {
            consumer: "order-created".to_owned(),
            queue: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            message_id: None,
            redelivered: false,
            payload,
            headers: json!({ "tenant": "acme" }),
        }
    }

    #[test]
    fn decodes_the_payload() {
        let msg = message(json!({ "order_id": "o-1" }));
        assert_eq!(
            msg.decode::<OrderCreated>().unwrap(),
            OrderCreated {
                order_id: "o-1".to_owned()
            }
        );
        assert_eq!(msg.header("tenant"), Some(&json!("acme")));

        let err = message(json!({ "id": 1 })).decode::<OrderCreated>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn closures_run_as_handlers() {
        let Handler::Single(handler) = handler_fn(|msg: ConsumerMessage| async move {
            if msg.payload["fail"] == json!(true) {
                Err(HandlerError::retryable("asked to fail"))
            } else {
                Ok(())
            }
        }) else {
            panic!("expected a single handler");
        };

        let ctx = Context::new();
        assert!(handler.exec(&ctx, &message(json!({}))).await.is_ok());
        assert!(handler.exec(&ctx, &message(json!({ "fail": true }))).await.is_err());
    }

    #[tokio::test]
    async fn batch_closures_see_the_whole_batch() {
        let Handler::Batch(handler) = batch_handler_fn(|msgs: Vec<ConsumerMessage>| async move {
            assert_eq!(msgs.len(), 2);
            Ok::<_, HandlerError>(())
        }) else {
            panic!("expected a batch handler");
        };

        let msgs = vec![message(json!({ "n": 1 })), message(json!({ "n": 2 }))];
        handler.exec(&Context::new(), &msgs).await.unwrap();
    }
}
