// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Description
//!
//! The declarative description every client and worker works from: named
//! maps of exchanges, queues, bindings, publishers and consumers. It is built
//! once at startup, then shared read-only (usually behind an `Arc`).

use crate::{
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    schema::{MessageSchema, TypedSchema},
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Payload schema plus an optional headers schema.
#[derive(Clone)]
pub struct MessageDefinition {
    pub(crate) payload: Arc<dyn MessageSchema>,
    pub(crate) headers: Option<Arc<dyn MessageSchema>>,
}

impl MessageDefinition {
    pub fn new(payload: impl MessageSchema + 'static) -> MessageDefinition {
        MessageDefinition {
            payload: Arc::new(payload),
            headers: None,
        }
    }

    /// Message whose payload must deserialize into `T`.
    pub fn typed<T>() -> MessageDefinition
    where
        T: DeserializeOwned + 'static,
    {
        Self::new(TypedSchema::<T>::new())
    }

    pub fn with_headers(mut self, headers: impl MessageSchema + 'static) -> Self {
        self.headers = Some(Arc::new(headers));
        self
    }

    pub fn payload_schema(&self) -> &dyn MessageSchema {
        self.payload.as_ref()
    }

    pub fn headers_schema(&self) -> Option<&dyn MessageSchema> {
        self.headers.as_deref()
    }
}

impl fmt::Debug for MessageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDefinition")
            .field("headers", &self.headers.is_some())
            .finish_non_exhaustive()
    }
}

/// Either side of a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingDefinition {
    Queue(QueueBinding),
    Exchange(ExchangeBinding),
}

impl From<QueueBinding> for BindingDefinition {
    fn from(binding: QueueBinding) -> Self {
        BindingDefinition::Queue(binding)
    }
}

impl From<ExchangeBinding> for BindingDefinition {
    fn from(binding: ExchangeBinding) -> Self {
        BindingDefinition::Exchange(binding)
    }
}

/// Where a named publisher sends its messages.
#[derive(Debug, Clone)]
pub struct PublisherDefinition {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: Option<String>,
    pub(crate) message: MessageDefinition,
}

impl PublisherDefinition {
    pub fn new(exchange: &ExchangeDefinition, message: MessageDefinition) -> PublisherDefinition {
        PublisherDefinition {
            exchange: exchange.clone(),
            routing_key: None,
            message,
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn message(&self) -> &MessageDefinition {
        &self.message
    }
}

/// Which queue a named consumer reads and what it expects to find there.
#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub(crate) queue: QueueDefinition,
    pub(crate) message: MessageDefinition,
}

impl ConsumerDefinition {
    pub fn new(queue: &QueueDefinition, message: MessageDefinition) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.clone(),
            message,
        }
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn message(&self) -> &MessageDefinition {
        &self.message
    }
}

/// Named maps of the five entity kinds.
#[derive(Debug, Clone, Default)]
pub struct TopologyDescription {
    pub(crate) exchanges: BTreeMap<String, ExchangeDefinition>,
    pub(crate) queues: BTreeMap<String, QueueDefinition>,
    pub(crate) bindings: BTreeMap<String, BindingDefinition>,
    pub(crate) publishers: BTreeMap<String, PublisherDefinition>,
    pub(crate) consumers: BTreeMap<String, ConsumerDefinition>,
}

impl TopologyDescription {
    pub fn new() -> TopologyDescription {
        TopologyDescription::default()
    }

    pub fn exchange(mut self, key: &str, def: ExchangeDefinition) -> Self {
        self.exchanges.insert(key.to_owned(), def);
        self
    }

    pub fn queue(mut self, key: &str, def: QueueDefinition) -> Self {
        self.queues.insert(key.to_owned(), def);
        self
    }

    pub fn binding(mut self, key: &str, binding: impl Into<BindingDefinition>) -> Self {
        self.bindings.insert(key.to_owned(), binding.into());
        self
    }

    pub fn publisher(mut self, key: &str, def: PublisherDefinition) -> Self {
        self.publishers.insert(key.to_owned(), def);
        self
    }

    pub fn consumer(mut self, key: &str, def: ConsumerDefinition) -> Self {
        self.consumers.insert(key.to_owned(), def);
        self
    }

    pub fn exchanges(&self) -> &BTreeMap<String, ExchangeDefinition> {
        &self.exchanges
    }

    pub fn queues(&self) -> &BTreeMap<String, QueueDefinition> {
        &self.queues
    }

    pub fn bindings(&self) -> &BTreeMap<String, BindingDefinition> {
        &self.bindings
    }

    pub fn publishers(&self) -> &BTreeMap<String, PublisherDefinition> {
        &self.publishers
    }

    pub fn consumers(&self) -> &BTreeMap<String, ConsumerDefinition> {
        &self.consumers
    }

    pub fn get_publisher(&self, name: &str) -> Option<&PublisherDefinition> {
        self.publishers.get(name)
    }

    pub fn get_consumer(&self, name: &str) -> Option<&ConsumerDefinition> {
        self.consumers.get(name)
    }

    /// Whether an exchange with this broker name is declared.
    pub fn declares_exchange(&self, name: &str) -> bool {
        self.exchanges.values().any(|def| def.name == name)
    }
}
