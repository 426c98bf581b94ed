// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! It includes support for dead-letter exchanges, quorum delivery limits and
//! the retry policy that decides what happens when a handler fails.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    retry::{RetryPolicy, TtlBackoffPolicy},
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify the quorum delivery limit
pub const AMQP_HEADERS_DELIVERY_LIMIT: &str = "x-delivery-limit";
/// Constant for the argument used to specify the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";

/// Suffix of the queue holding messages between TTL-backoff retries
pub const WAIT_QUEUE_SUFFIX: &str = "-wait";

/// Queue flavour on the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueKind {
    #[default]
    Quorum,
    Classic,
}

/// Where rejected, expired and over-limit messages are rerouted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterConfig {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: Option<String>,
}

impl DeadLetterConfig {
    pub fn new(exchange: ExchangeDefinition) -> DeadLetterConfig {
        DeadLetterConfig {
            exchange,
            routing_key: None,
        }
    }

    /// Routing key of dead-lettered messages. Without one they keep the key
    /// they were published with.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are durable by default and use TTL-backoff retries with the default
/// policy unless told otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) kind: QueueKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
    pub(crate) dead_letter: Option<DeadLetterConfig>,
    pub(crate) delivery_limit: Option<u32>,
    pub(crate) retry: RetryPolicy,
}

impl QueueDefinition {
    fn new(name: &str, kind: QueueKind) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            kind,
            durable: true,
            auto_delete: false,
            exclusive: false,
            arguments: BTreeMap::default(),
            dead_letter: None,
            delivery_limit: None,
            retry: RetryPolicy::TtlBackoff(TtlBackoffPolicy::default()),
        }
    }

    /// Creates a quorum queue definition.
    pub fn quorum(name: &str) -> QueueDefinition {
        Self::new(name, QueueKind::Quorum)
    }

    /// Creates a classic queue definition.
    pub fn classic(name: &str) -> QueueDefinition {
        Self::new(name, QueueKind::Classic)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterConfig> {
        self.dead_letter.as_ref()
    }

    /// Makes the queue transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Adds a single broker argument to the queue.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Routes rejected and expired messages to the given dead-letter configuration.
    pub fn dead_letter_to(mut self, config: DeadLetterConfig) -> Self {
        self.dead_letter = Some(config);
        self
    }

    /// Sets the quorum delivery limit. Only valid on quorum queues.
    pub fn delivery_limit(mut self, limit: u32) -> Self {
        self.delivery_limit = Some(limit);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Name of the queue parking messages between TTL-backoff retries.
    pub fn wait_queue_name(&self) -> String {
        format!("{}{}", self.name, WAIT_QUEUE_SUFFIX)
    }

    /// Whether provisioning derives a wait queue for this definition.
    pub fn has_wait_queue(&self) -> bool {
        matches!(self.retry, RetryPolicy::TtlBackoff(_)) && self.dead_letter.is_some()
    }

    /// Checks the invariants tying kind, delivery limit and retry policy together.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.delivery_limit.is_some() && self.kind != QueueKind::Quorum {
            return Err(AmqpError::InvalidTopology(
                self.name.clone(),
                "delivery limit is only supported on quorum queues".to_owned(),
            ));
        }

        if self.retry == RetryPolicy::QuorumNative
            && (self.kind != QueueKind::Quorum || self.delivery_limit.is_none())
        {
            return Err(AmqpError::InvalidTopology(
                self.name.clone(),
                "quorum-native retry requires a quorum queue with a delivery limit".to_owned(),
            ));
        }

        if let RetryPolicy::TtlBackoff(policy) = &self.retry {
            policy
                .validate()
                .map_err(|reason| AmqpError::InvalidTopology(self.name.clone(), reason))?;
        }

        Ok(())
    }

    /// Broker arguments for the declaration: the queue's own arguments merged
    /// with the derived queue type, delivery limit and dead-letter arguments.
    pub(crate) fn declare_arguments(&self) -> FieldTable {
        let mut args = self.arguments.clone();

        if self.kind == QueueKind::Quorum {
            args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from("quorum")),
            );
        }

        if let Some(limit) = self.delivery_limit {
            args.insert(
                ShortString::from(AMQP_HEADERS_DELIVERY_LIMIT),
                AMQPValue::LongInt(LongInt::from(limit as i32)),
            );
        }

        if let Some(dlc) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlc.exchange.name.clone())),
            );

            if let Some(key) = &dlc.routing_key {
                args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(key.clone())),
                );
            }
        }

        FieldTable::from(args)
    }

    /// Arguments of the derived wait queue: expired messages dead-letter back
    /// through the DLX with the main queue's name as routing key.
    pub(crate) fn wait_queue_arguments(&self) -> Option<FieldTable> {
        if !self.has_wait_queue() {
            return None;
        }

        let dlc = self.dead_letter.as_ref()?;
        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlc.exchange.name.clone())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.name.clone())),
        );

        Some(FieldTable::from(args))
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: Option<String>,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    /// Creates a new binding of `queue` to `exchange` without routing key.
    pub fn new(queue: &str, exchange: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: None,
            arguments: BTreeMap::default(),
        }
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dlx() -> ExchangeDefinition {
        ExchangeDefinition::direct("orders-dlx")
    }

    #[test]
    fn merges_dead_letter_arguments_with_own_arguments() {
        let def = QueueDefinition::classic("orders")
            .argument("x-max-length", AMQPValue::LongInt(100))
            .dead_letter_to(DeadLetterConfig::new(dlx()).routing_key("orders.dead"));

        let args = def.declare_arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get("x-max-length"),
            Some(&AMQPValue::LongInt(100))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("orders-dlx".into()))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("orders.dead".into()))
        );
        assert!(inner.get(AMQP_HEADERS_QUEUE_TYPE).is_none());
    }

    #[test]
    fn quorum_queues_carry_type_and_delivery_limit() {
        let def = QueueDefinition::quorum("payments")
            .delivery_limit(2)
            .retry(RetryPolicy::QuorumNative);

        let args = def.declare_arguments();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DELIVERY_LIMIT),
            Some(&AMQPValue::LongInt(2))
        );
        assert!(def.validate().is_ok());
        assert!(!def.has_wait_queue());
    }

    #[test]
    fn rejects_delivery_limit_on_classic_queue() {
        let def = QueueDefinition::classic("orders").delivery_limit(3);
        assert!(matches!(
            def.validate(),
            Err(AmqpError::InvalidTopology(name, _)) if name == "orders"
        ));
    }

    #[test]
    fn rejects_quorum_native_without_delivery_limit() {
        let def = QueueDefinition::quorum("orders").retry(RetryPolicy::QuorumNative);
        assert!(def.validate().is_err());
    }

    #[test]
    fn wait_queue_dead_letters_back_to_main_queue() {
        let def = QueueDefinition::classic("orders").dead_letter_to(DeadLetterConfig::new(dlx()));

        assert_eq!(def.wait_queue_name(), "orders-wait");
        let args = def.wait_queue_arguments().unwrap();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("orders".into()))
        );
    }

    #[test]
    fn no_wait_queue_without_dead_letter_exchange() {
        let def = QueueDefinition::classic("orders");
        assert!(!def.has_wait_queue());
        assert!(def.wait_queue_arguments().is_none());
    }
}
