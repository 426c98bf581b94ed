// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Core
//!
//! A reliability layer over an AMQP 0-9-1 broker: idempotent topology
//! provisioning, reference-counted connection sharing, schema validation at
//! the publish and consume boundaries, and at-least-once consumption with
//! TTL-backoff or quorum-native retries and optional batching.
//!
//! `AmqpClient` publishes, `AmqpWorker` consumes. Both run over any
//! `ConnectionFactory`: `channel::LapinConnectionFactory` for a real broker,
//! `memory::InMemoryBroker` for tests.

mod batch;
mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod compression;
pub mod configs;
pub mod connection;
pub mod contract;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod topology;
pub mod worker;

pub use batch::DEFAULT_BATCH_TIMEOUT;
pub use client::AmqpClient;
pub use connection::ConnectionRegistry;
pub use contract::TopologyDescription;
pub use worker::{AmqpWorker, ConsumerRegistration};
