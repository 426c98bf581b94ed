// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Coordination
//!
//! When a handler fails, the coordinator decides what happens to the message.
//! The decision depends on the owning queue's retry mode, resolved once when
//! the consumer starts:
//!
//! - `TtlBackoff`: the message is copied to `{queue}-wait` with a per-message
//!   expiration and retry bookkeeping headers. When the copy expires, the wait
//!   queue dead-letters it through the DLX back to the main queue. Once the
//!   budget is spent the message is nacked without requeue and the broker
//!   routes it to the DLX. A message that came back through the wait queue
//!   carries the queue name as routing key; without a configured dead-letter
//!   routing key it is republished to the DLX under the key it was first
//!   published with, then acked.
//! - `ImmediateRequeue`: TTL-backoff declared without a dead-letter exchange.
//!   There is nowhere to park or terminate the message, so it is requeued on
//!   the main queue immediately and indefinitely.
//! - `QuorumNative`: nack with requeue; the quorum queue's delivery limit
//!   decides when to dead-letter.
//!
//! ```text
//! Delivered -> HandlerFailed -+-> Requeued (wait queue, TTL)
//!                             +-> DeadLettered (nack, no requeue)
//!                             +-> RequeuedImmediate (nack, requeue)
//! ```

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::{AmqpError, HandlerError},
    headers,
    queue::QueueDefinition,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, warn};

/// Header carrying how many times the message was retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the last handler failure
pub const AMQP_HEADERS_LAST_ERROR: &str = "x-last-error";
/// Header carrying the epoch millis of the first failure
pub const AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP: &str = "x-first-failure-timestamp";
/// Header carrying the routing key of the first failed delivery
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Exponential backoff parameters for TTL-based retries.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlBackoffPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Shaves a random amount (up to half) off each delay
    pub jitter: bool,
}

impl Default for TtlBackoffPolicy {
    fn default() -> Self {
        TtlBackoffPolicy {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl TtlBackoffPolicy {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(format!(
                "backoff multiplier must be a finite value >= 1, got {}",
                self.backoff_multiplier
            ));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "max delay {}ms is smaller than initial delay {}ms",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }

        Ok(())
    }

    /// `min(max_delay_ms, initial_delay_ms * backoff_multiplier ^ retry_count)`
    pub fn base_delay(&self, retry_count: u32) -> u64 {
        let exp = self.backoff_multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
        let delay = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        delay as u64
    }

    /// Delay before the next attempt, jittered when enabled.
    pub fn next_delay(&self, retry_count: u32) -> u64 {
        let delay = self.base_delay(retry_count);
        if self.jitter && delay > 1 {
            delay - fastrand::u64(0..=delay / 2)
        } else {
            delay
        }
    }
}

/// How a queue retries failed messages.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    TtlBackoff(TtlBackoffPolicy),
    QuorumNative,
}

impl RetryPolicy {
    pub fn ttl_backoff(policy: TtlBackoffPolicy) -> RetryPolicy {
        RetryPolicy::TtlBackoff(policy)
    }
}

/// Retry bookkeeping carried in message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub first_failure_timestamp: i64,
    pub original_routing_key: Option<String>,
}

impl RetryState {
    /// Reads the retry headers, defaulting the count to 0 and the first failure to `now`.
    pub fn from_properties(properties: &BasicProperties, now: i64) -> RetryState {
        let table = properties.headers().clone().unwrap_or_default();
        let inner = table.inner();

        RetryState {
            retry_count: inner
                .get(AMQP_HEADERS_RETRY_COUNT)
                .and_then(headers::as_i64)
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or_default(),
            last_error: inner.get(AMQP_HEADERS_LAST_ERROR).and_then(headers::as_string),
            first_failure_timestamp: inner
                .get(AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP)
                .and_then(headers::as_i64)
                .unwrap_or(now),
            original_routing_key: inner
                .get(AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
                .and_then(headers::as_string),
        }
    }

    /// State after one more failed attempt of a delivery routed with `routing_key`.
    pub fn next(&self, error: &str, routing_key: &str) -> RetryState {
        RetryState {
            retry_count: self.retry_count + 1,
            last_error: Some(error.to_owned()),
            first_failure_timestamp: self.first_failure_timestamp,
            original_routing_key: Some(
                self.original_routing_key
                    .clone()
                    .unwrap_or_else(|| routing_key.to_owned()),
            ),
        }
    }

    /// Properties of the wait-queue copy: the original ones with updated
    /// retry headers, an expiration and persistent delivery.
    pub fn apply(&self, properties: &BasicProperties, expiration_ms: u64) -> BasicProperties {
        let mut table = properties.headers().clone().unwrap_or_default().inner().clone();

        table.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count)),
        );
        table.insert(
            ShortString::from(AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP),
            AMQPValue::LongLongInt(self.first_failure_timestamp),
        );
        if let Some(err) = &self.last_error {
            table.insert(
                ShortString::from(AMQP_HEADERS_LAST_ERROR),
                AMQPValue::LongString(LongString::from(err.clone())),
            );
        }
        if let Some(key) = &self.original_routing_key {
            table.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        properties
            .clone()
            .with_headers(FieldTable::from(table))
            .with_expiration(ShortString::from(expiration_ms.to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    }
}

/// Retry behavior of one queue, resolved from its definition once.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryMode {
    TtlBackoff {
        policy: TtlBackoffPolicy,
        wait_queue: String,
        dead_letter_exchange: String,
        dead_letter_routing_key: Option<String>,
    },
    ImmediateRequeue,
    QuorumNative,
}

impl RetryMode {
    pub fn resolve(def: &QueueDefinition) -> RetryMode {
        match def.retry_policy() {
            RetryPolicy::QuorumNative => RetryMode::QuorumNative,
            RetryPolicy::TtlBackoff(policy) => match def.dead_letter() {
                Some(dlc) => RetryMode::TtlBackoff {
                    policy: policy.clone(),
                    wait_queue: def.wait_queue_name(),
                    dead_letter_exchange: dlc.exchange().name().to_owned(),
                    dead_letter_routing_key: dlc.routing_key.clone(),
                },
                None => {
                    warn!(
                        queue = def.name(),
                        "ttl-backoff retry without dead-letter exchange, failed messages will be requeued indefinitely"
                    );
                    RetryMode::ImmediateRequeue
                }
            },
        }
    }
}

/// Terminal state a failed delivery was moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Parked in the wait queue until its expiration
    Requeued { retry_count: u32, delay_ms: u64 },
    /// Nacked without requeue, routed to the DLX when one is configured
    DeadLettered,
    /// Nacked with requeue on the main queue
    RequeuedImmediate,
}

/// Applies the queue's retry mode to failed deliveries.
pub struct RetryCoordinator {
    queue: String,
    mode: RetryMode,
    channel: Arc<dyn BrokerChannel>,
}

impl RetryCoordinator {
    pub fn new(channel: Arc<dyn BrokerChannel>, def: &QueueDefinition) -> RetryCoordinator {
        RetryCoordinator {
            queue: def.name().to_owned(),
            mode: RetryMode::resolve(def),
            channel,
        }
    }

    pub fn mode(&self) -> &RetryMode {
        &self.mode
    }

    pub async fn handle_failure(
        &self,
        delivery: &Delivery,
        failure: &HandlerError,
    ) -> Result<RetryOutcome, AmqpError> {
        match &self.mode {
            RetryMode::TtlBackoff { policy, wait_queue, .. } => {
                self.ttl_backoff(delivery, failure, policy, wait_queue).await
            }
            RetryMode::ImmediateRequeue => {
                if failure.is_retryable() {
                    warn!(queue = %self.queue, error = failure.message(), "requeuing msg immediately");
                    self.nack(delivery, true).await?;
                    Ok(RetryOutcome::RequeuedImmediate)
                } else {
                    error!(
                        queue = %self.queue,
                        error = failure.message(),
                        "non retryable failure without dead-letter exchange, discarding msg"
                    );
                    self.nack(delivery, false).await?;
                    Ok(RetryOutcome::DeadLettered)
                }
            }
            RetryMode::QuorumNative => {
                let requeue = failure.is_retryable();
                debug!(queue = %self.queue, requeue, "nacking msg, delivery limit decides");
                self.nack(delivery, requeue).await?;
                if requeue {
                    Ok(RetryOutcome::RequeuedImmediate)
                } else {
                    Ok(RetryOutcome::DeadLettered)
                }
            }
        }
    }

    async fn ttl_backoff(
        &self,
        delivery: &Delivery,
        failure: &HandlerError,
        policy: &TtlBackoffPolicy,
        wait_queue: &str,
    ) -> Result<RetryOutcome, AmqpError> {
        let state = RetryState::from_properties(&delivery.properties, now_millis());

        if !failure.is_retryable() {
            error!(queue = %self.queue, error = failure.message(), "non retryable failure, sending to dlq");
            return self.dead_letter(delivery, &state).await;
        }

        if state.retry_count >= policy.max_retries {
            error!(
                queue = %self.queue,
                retries = state.retry_count,
                "too many attempts, sending to dlq"
            );
            return self.dead_letter(delivery, &state).await;
        }

        let delay_ms = policy.next_delay(state.retry_count);
        let next = state.next(failure.message(), &delivery.routing_key);
        let properties = next.apply(&delivery.properties, delay_ms);

        warn!(
            queue = %self.queue,
            retry = next.retry_count,
            delay_ms,
            "error whiling handling msg, requeuing for latter"
        );

        // the copy must exist before the original goes away
        if let Err(err) = self
            .channel
            .publish("", wait_queue, &delivery.data, properties)
            .await
        {
            error!(error = err.to_string(), queue = wait_queue, "failure to publish to wait queue");
            self.nack(delivery, true).await?;
            return Err(err);
        }

        self.channel.ack(delivery.delivery_tag).await?;

        Ok(RetryOutcome::Requeued {
            retry_count: next.retry_count,
            delay_ms,
        })
    }

    /// Routes a TTL-backoff delivery to the DLX. Deliveries still carrying the
    /// routing key they were published with are nacked; the rest are
    /// republished under that key when the queue sets no dead-letter routing key.
    async fn dead_letter(&self, delivery: &Delivery, state: &RetryState) -> Result<RetryOutcome, AmqpError> {
        let RetryMode::TtlBackoff {
            dead_letter_exchange,
            dead_letter_routing_key: None,
            ..
        } = &self.mode
        else {
            self.nack(delivery, false).await?;
            return Ok(RetryOutcome::DeadLettered);
        };

        let Some(original) = state
            .original_routing_key
            .as_deref()
            .filter(|key| *key != delivery.routing_key)
        else {
            self.nack(delivery, false).await?;
            return Ok(RetryOutcome::DeadLettered);
        };

        debug!(
            queue = %self.queue,
            exchange = %dead_letter_exchange,
            routing_key = original,
            "republishing msg to dlx under its original routing key"
        );

        if let Err(err) = self
            .channel
            .publish(dead_letter_exchange, original, &delivery.data, delivery.properties.clone())
            .await
        {
            error!(error = err.to_string(), exchange = %dead_letter_exchange, "failure to publish to dlx");
            self.nack(delivery, true).await?;
            return Err(err);
        }

        self.channel.ack(delivery.delivery_tag).await?;
        Ok(RetryOutcome::DeadLettered)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .nack(delivery.delivery_tag, requeue)
            .await
            .inspect_err(|err| error!(error = err.to_string(), queue = %self.queue, "error whiling nack msg"))
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel, exchange::ExchangeDefinition, queue::DeadLetterConfig,
    };
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    fn policy() -> TtlBackoffPolicy {
        TtlBackoffPolicy {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 3.0,
            jitter: false,
        }
    }

    fn ttl_queue() -> QueueDefinition {
        QueueDefinition::classic("orders")
            .dead_letter_to(DeadLetterConfig::new(ExchangeDefinition::direct("orders-dlx")))
            .retry(RetryPolicy::TtlBackoff(policy()))
    }

    fn delivery_with_retries(count: Option<i64>) -> Delivery {
        let mut headers = BTreeMap::new();
        if let Some(count) = count {
            headers.insert(
                ShortString::from(AMQP_HEADERS_RETRY_COUNT),
                AMQPValue::LongLongInt(count),
            );
            headers.insert(
                ShortString::from(AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP),
                AMQPValue::LongLongInt(42),
            );
        }

        Delivery {
            delivery_tag: 7,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            redelivered: false,
            properties: BasicProperties::default().with_headers(FieldTable::from(headers)),
            data: br#"{"id":1}"#.to_vec(),
        }
    }

    /// An exhausted delivery that came back to `orders` through the wait queue.
    fn returned_from_wait_queue() -> Delivery {
        let mut delivery = delivery_with_retries(Some(3));
        let mut table = delivery.properties.headers().clone().unwrap_or_default().inner().clone();
        table.insert(
            ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
            AMQPValue::LongString("order.created".into()),
        );
        delivery.properties = delivery.properties.with_headers(FieldTable::from(table));
        delivery.exchange = "orders-dlx".to_owned();
        delivery.routing_key = "orders".to_owned();
        delivery
    }

    fn header(props: &BasicProperties, key: &str) -> Option<AMQPValue> {
        props
            .headers()
            .as_ref()
            .and_then(|h| h.inner().get(key).cloned())
    }

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay(0), 100);
        assert_eq!(p.base_delay(1), 300);
        assert_eq!(p.base_delay(2), 900);
        assert_eq!(p.base_delay(10), 10_000);
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let p = TtlBackoffPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..100 {
            let delay = p.next_delay(2);
            assert!((450..=900).contains(&delay));
        }
    }

    #[test]
    fn resolves_modes_from_definitions() {
        assert!(matches!(
            RetryMode::resolve(&ttl_queue()),
            RetryMode::TtlBackoff { wait_queue, .. } if wait_queue == "orders-wait"
        ));
        assert_eq!(
            RetryMode::resolve(&QueueDefinition::classic("orders")),
            RetryMode::ImmediateRequeue
        );
        assert_eq!(
            RetryMode::resolve(
                &QueueDefinition::quorum("orders")
                    .delivery_limit(2)
                    .retry(RetryPolicy::QuorumNative)
            ),
            RetryMode::QuorumNative
        );
    }

    #[test]
    fn retry_state_preserves_first_failure() {
        let delivery = delivery_with_retries(Some(1));
        let state = RetryState::from_properties(&delivery.properties, 1000);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.first_failure_timestamp, 42);

        let next = state.next("boom", "order.created");
        let props = next.apply(&delivery.properties, 300);
        assert_eq!(
            header(&props, AMQP_HEADERS_RETRY_COUNT),
            Some(AMQPValue::LongLongInt(2))
        );
        assert_eq!(
            header(&props, AMQP_HEADERS_FIRST_FAILURE_TIMESTAMP),
            Some(AMQPValue::LongLongInt(42))
        );
        assert_eq!(props.expiration().as_ref().map(|e| e.as_str()), Some("300"));
    }

    #[tokio::test]
    async fn first_failure_goes_to_wait_queue_then_acks() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = mockall::Sequence::new();
        channel
            .expect_publish()
            .withf(|exchange, routing_key, body, props| {
                exchange.is_empty()
                    && routing_key == "orders-wait"
                    && body == br#"{"id":1}"#
                    && props.expiration().as_ref().map(|e| e.as_str()) == Some("100")
                    && header(props, AMQP_HEADERS_RETRY_COUNT) == Some(AMQPValue::LongLongInt(1))
                    && header(props, AMQP_HEADERS_LAST_ERROR)
                        == Some(AMQPValue::LongString("boom".into()))
                    && header(props, AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
                        == Some(AMQPValue::LongString("order.created".into()))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_ack()
            .with(eq(7))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let coordinator = RetryCoordinator::new(Arc::new(channel), &ttl_queue());
        let outcome = coordinator
            .handle_failure(&delivery_with_retries(None), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Requeued {
                retry_count: 1,
                delay_ms: 100
            }
        );
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();
        channel
            .expect_nack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = RetryCoordinator::new(Arc::new(channel), &ttl_queue());
        let outcome = coordinator
            .handle_failure(&delivery_with_retries(Some(3)), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn exhausted_budget_republishes_under_the_original_routing_key() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = mockall::Sequence::new();
        channel
            .expect_publish()
            .withf(|exchange, routing_key, body, props| {
                exchange == "orders-dlx"
                    && routing_key == "order.created"
                    && body == br#"{"id":1}"#
                    && header(props, AMQP_HEADERS_RETRY_COUNT) == Some(AMQPValue::LongLongInt(3))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_ack()
            .with(eq(7))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel.expect_nack().never();

        let coordinator = RetryCoordinator::new(Arc::new(channel), &ttl_queue());
        let outcome = coordinator
            .handle_failure(&returned_from_wait_queue(), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn configured_dead_letter_routing_key_keeps_the_broker_route() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();
        channel
            .expect_nack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let def = QueueDefinition::classic("orders")
            .dead_letter_to(DeadLetterConfig::new(ExchangeDefinition::direct("orders-dlx")).routing_key("orders.dead"))
            .retry(RetryPolicy::TtlBackoff(policy()));
        let coordinator = RetryCoordinator::new(Arc::new(channel), &def);
        let outcome = coordinator
            .handle_failure(&returned_from_wait_queue(), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn non_retryable_skips_the_budget() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();
        channel
            .expect_nack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = RetryCoordinator::new(Arc::new(channel), &ttl_queue());
        let outcome = coordinator
            .handle_failure(&delivery_with_retries(None), &HandlerError::non_retryable("bad"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn failed_wait_queue_publish_requeues_original() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("blocked".to_owned())));
        channel.expect_ack().never();
        channel
            .expect_nack()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = RetryCoordinator::new(Arc::new(channel), &ttl_queue());
        assert!(coordinator
            .handle_failure(&delivery_with_retries(None), &HandlerError::retryable("boom"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn quorum_native_requeues_with_nack() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let def = QueueDefinition::quorum("payments")
            .delivery_limit(2)
            .retry(RetryPolicy::QuorumNative);
        let coordinator = RetryCoordinator::new(Arc::new(channel), &def);
        let outcome = coordinator
            .handle_failure(&delivery_with_retries(None), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::RequeuedImmediate);
    }

    #[tokio::test]
    async fn without_dead_letter_exchange_requeues_immediately() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = RetryCoordinator::new(Arc::new(channel), &QueueDefinition::classic("orders"));
        let outcome = coordinator
            .handle_failure(&delivery_with_retries(Some(10)), &HandlerError::retryable("boom"))
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::RequeuedImmediate);
    }
}
