// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ exchanges and the
//! exchange-to-exchange bindings between them. Exchanges are the routing
//! mechanism in RabbitMQ that determine how messages are distributed to queues.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::collections::BTreeMap;

/// Represents the types of exchanges supported by the topology.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with one named constructor per kind, then refined with the builder
/// methods. Exchanges are durable by default. Identity is the name.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    fn new(name: &str, kind: ExchangeKind) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: BTreeMap::default(),
        }
    }

    /// Creates a direct exchange definition.
    pub fn direct(name: &str) -> ExchangeDefinition {
        Self::new(name, ExchangeKind::Direct)
    }

    /// Creates a fanout exchange definition.
    pub fn fanout(name: &str) -> ExchangeDefinition {
        Self::new(name, ExchangeKind::Fanout)
    }

    /// Creates a topic exchange definition.
    pub fn topic(name: &str) -> ExchangeDefinition {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Adds a single broker argument to the exchange.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Makes the exchange transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        FieldTable::from(self.arguments.clone())
    }
}

/// Binding from a source exchange to a destination exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeBinding {
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) routing_key: Option<String>,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeBinding {
    /// Creates a binding that forwards messages from `source` to `destination`.
    pub fn new(source: &str, destination: &str) -> ExchangeBinding {
        ExchangeBinding {
            source: source.to_owned(),
            destination: destination.to_owned(),
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
