// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module validates outbound payloads against the publisher's schema and
//! publishes them to the publisher's exchange. Validation failures are returned
//! without touching the network. Messages are published as persistent JSON,
//! optionally compressed, with the current OpenTelemetry context injected in
//! their headers.

use crate::{
    broker::BrokerChannel,
    compression::CompressionAlgorithm,
    contract::{PublisherDefinition, TopologyDescription},
    errors::{AmqpError, PublishError, ValidationError},
    exchange::ExchangeKind,
    headers, otel,
    retry::PERSISTENT_DELIVERY_MODE,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde_json::{Map, Value};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-publish options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub(crate) compression: Option<String>,
    pub(crate) headers: Map<String, Value>,
    pub(crate) expiration: Option<Duration>,
    pub(crate) routing_key: Option<String>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Compresses the payload. Only `gzip` and `deflate` are accepted, any
    /// other name fails the publish before it reaches the broker.
    pub fn compression(mut self, algorithm: impl ToString) -> Self {
        self.compression = Some(algorithm.to_string());
        self
    }

    pub fn header(mut self, key: &str, value: Value) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn headers(mut self, headers: Map<String, Value>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Per-message TTL.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Overrides the publisher's routing key, e.g. for topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }
}

/// Validates and publishes payloads for the publishers of one topology.
pub struct PublishPipeline {
    channel: Arc<dyn BrokerChannel>,
    topology: Arc<TopologyDescription>,
}

impl PublishPipeline {
    pub fn new(channel: Arc<dyn BrokerChannel>, topology: Arc<TopologyDescription>) -> PublishPipeline {
        PublishPipeline { channel, topology }
    }

    /// Publishes `payload` through the named publisher.
    ///
    /// # Returns
    /// * `PublishError::Validation` when the payload or headers do not match
    ///   the publisher's schemas, nothing is sent in that case
    /// * `PublishError::Technical` for unknown publishers, unsupported
    ///   compression and broker failures
    pub async fn publish(
        &self,
        publisher: &str,
        payload: &Value,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let Some(def) = self.topology.get_publisher(publisher) else {
            error!(publisher, "unknown publisher");
            return Err(AmqpError::UnknownPublisher(publisher.to_owned()).into());
        };

        validate(publisher, def, payload, &options)?;

        let compression = options
            .compression
            .as_deref()
            .map(CompressionAlgorithm::from_str)
            .transpose()?;

        let body = serde_json::to_vec(payload).map_err(|err| AmqpError::InternalError(err.to_string()))?;
        let body = match compression {
            Some(algorithm) => algorithm.compress(&body)?,
            None => body,
        };

        let routing_key = match def.exchange.kind() {
            ExchangeKind::Fanout => String::new(),
            _ => options
                .routing_key
                .clone()
                .or_else(|| def.routing_key.clone())
                .unwrap_or_default(),
        };

        let mut table = headers::json_to_table(&options.headers);
        otel::inject_current(&mut table);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(FieldTable::from(table));
        if let Some(algorithm) = compression {
            properties = properties.with_content_encoding(ShortString::from(algorithm.as_str()));
        }
        if let Some(ttl) = options.expiration {
            properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        self.channel
            .publish(def.exchange.name(), &routing_key, &body, properties)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    publisher,
                    exchange = def.exchange.name(),
                    "error publishing message"
                )
            })?;

        debug!(publisher, exchange = def.exchange.name(), routing_key = %routing_key, "message published");
        Ok(())
    }
}

fn validate(
    publisher: &str,
    def: &PublisherDefinition,
    payload: &Value,
    options: &PublishOptions,
) -> Result<(), ValidationError> {
    def.message
        .payload_schema()
        .validate(payload)
        .map_err(|issues| ValidationError {
            source_name: publisher.to_owned(),
            issues,
        })?;

    if let Some(schema) = def.message.headers_schema() {
        schema
            .validate(&Value::Object(options.headers.clone()))
            .map_err(|issues| ValidationError {
                source_name: publisher.to_owned(),
                issues,
            })?;
    }

    Ok(())
}
