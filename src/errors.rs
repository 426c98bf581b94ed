// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy used across the crate:
//!
//! - `AmqpError`: technical failures (connection refusal, broker rejections,
//!   unsupported encodings, missing dead-letter exchanges, closed clients).
//! - `AggregateError`: every failed declaration of one provisioning phase.
//! - `ValidationError`: a payload or headers object rejected by its schema.
//! - `PublishError`: what `AmqpClient::publish` returns instead of panicking.
//! - `HandlerError`: the typed failure a message handler reports back.

use crate::schema::SchemaIssue;
use std::fmt;
use thiserror::Error;

/// Represents technical errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the operation that failed and carries enough context
/// (entity names, broker message) for the error to be actionable on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        reason: String,
    },

    /// Error binding an exchange to another exchange
    #[error("failure to bind exchange `{destination}` to exchange `{origin}`: {reason}")]
    BindingExchangeToExchangeError {
        origin: String,
        destination: String,
        reason: String,
    },

    /// A queue references a dead-letter exchange the topology never declares
    #[error(
        "queue `{queue}` references dead-letter exchange `{exchange}` which is not declared in the topology exchanges"
    )]
    MissingDeadLetterExchange { queue: String, exchange: String },

    /// A queue or binding definition breaks one of its invariants
    #[error("invalid topology definition `{0}`: {1}")]
    InvalidTopology(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The requested compression algorithm is not supported
    #[error("unsupported compression `{0}`, expected `gzip` or `deflate`")]
    UnsupportedCompression(String),

    /// An inbound message carries a content-encoding that cannot be decoded
    #[error("failure to decode content-encoding `{0}`: {1}")]
    UnsupportedEncoding(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error fetching a single message from a queue
    #[error("failure to get message from `{0}`: {1}")]
    GetMessageError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`: {1}")]
    ConsumerDeclarationError(String, String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The publisher name is not part of the topology
    #[error("unknown publisher `{0}`")]
    UnknownPublisher(String),

    /// The consumer name is not part of the topology
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),

    /// The client or worker was already closed
    #[error("`{0}` is closed")]
    ClosedError(String),

    /// A connection reference was released more times than it was acquired
    #[error("connection `{0}` released without a matching acquire")]
    ReleaseWithoutAcquire(String),

    /// Topology provisioning failed
    #[error(transparent)]
    Provisioning(#[from] AggregateError),
}

/// The provisioning phase a declaration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPhase {
    Exchanges,
    Queues,
    Bindings,
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionPhase::Exchanges => f.write_str("exchanges"),
            ProvisionPhase::Queues => f.write_str("queues"),
            ProvisionPhase::Bindings => f.write_str("bindings"),
        }
    }
}

/// Every failed declaration of one provisioning phase, bundled together.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failure to provision {phase}: {}", join_errors(.errors))]
pub struct AggregateError {
    pub phase: ProvisionPhase,
    pub errors: Vec<AmqpError>,
}

fn join_errors(errors: &[AmqpError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A payload or headers object did not satisfy its schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{source_name}` failed schema validation: {}", join_issues(.issues))]
pub struct ValidationError {
    /// The publisher or consumer the message belongs to
    pub source_name: String,
    pub issues: Vec<SchemaIssue>,
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a failed publish. Validation failures never reach the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Technical(#[from] AmqpError),
}

/// Failure reported by a message handler.
///
/// `Retryable` consumes the queue's retry budget; `NonRetryable` skips it and
/// sends the message straight to its terminal state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("non retryable: {0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(err: impl fmt::Display) -> Self {
        HandlerError::Retryable(err.to_string())
    }

    pub fn non_retryable(err: impl fmt::Display) -> Self {
        HandlerError::NonRetryable(err.to_string())
    }

    /// Classifies an arbitrary error. Unclassified failures are retryable.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        HandlerError::Retryable(err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(msg) | HandlerError::NonRetryable(msg) => msg,
        }
    }
}
