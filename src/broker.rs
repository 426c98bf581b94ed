// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The pipelines never talk to lapin directly: they go through the
//! `ConnectionFactory` / `BrokerConnection` / `BrokerChannel` traits defined
//! here. `channel` implements them on top of lapin, `memory` implements them
//! in-process. Message properties reuse lapin's `BasicProperties` so both
//! implementations share one property model.

use crate::{
    configs::ConnectionOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

/// A message handed out by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Deliveries of one subscription. `Ok(None)` signals the broker cancelled
/// the consumer (for instance because its queue was deleted).
pub type DeliveryStream = BoxStream<'static, Result<Option<Delivery>, AmqpError>>;

/// Declaration flags for `BrokerChannel::assert_queue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Opens physical connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        urls: &[String],
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One physical broker connection, multiplexing many channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// The broker operations the topology, publish and consume pipelines use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Caps the number of unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
