// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Physical broker connections are shared between every client and worker
//! built with the same URLs and options. The registry hands them out by
//! reference count: the first `acquire` opens the connection, the last
//! `release` closes it.

use crate::{
    broker::{BrokerConnection, ConnectionFactory},
    configs::ConnectionOptions,
    errors::AmqpError,
};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Canonical identity of a physical connection.
///
/// Serializes the URLs and options as JSON with every object key sorted, so
/// two equivalent configurations always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(urls: &[String], options: &ConnectionOptions) -> Result<ConnectionKey, AmqpError> {
        let options = serde_json::to_value(options)
            .map_err(|err| AmqpError::InternalError(err.to_string()))?;

        let value = canonicalize(json!({ "urls": urls, "options": options }));

        serde_json::to_string(&value)
            .map(ConnectionKey)
            .map_err(|err| AmqpError::InternalError(err.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

struct RegistryEntry {
    connection: Arc<dyn BrokerConnection>,
    references: usize,
}

/// Reference-counted cache of physical connections.
///
/// Built explicitly and passed to every client and worker that should share
/// connections; there is no process-wide instance.
pub struct ConnectionRegistry {
    factory: Arc<dyn ConnectionFactory>,
    entries: Mutex<HashMap<ConnectionKey, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry {
            factory,
            entries: Mutex::new(HashMap::default()),
        })
    }

    /// Returns the shared connection for `(urls, options)`, opening it on
    /// first use.
    ///
    /// The lock is held across the connect so that concurrent first
    /// acquisitions of one key open a single connection.
    pub async fn acquire(
        &self,
        urls: &[String],
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let key = ConnectionKey::new(urls, options)?;
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            entry.references += 1;
            debug!(references = entry.references, "reusing amqp connection");
            return Ok(entry.connection.clone());
        }

        debug!("creating amqp connection...");
        let connection = self.factory.connect(urls, options).await?;
        entries.insert(
            key,
            RegistryEntry {
                connection: connection.clone(),
                references: 1,
            },
        );
        debug!("amqp connected");

        Ok(connection)
    }

    /// Drops one reference, closing the connection when it was the last one.
    ///
    /// Releasing a key that holds no reference is reported as
    /// `ReleaseWithoutAcquire` and never closes anything.
    pub async fn release(&self, urls: &[String], options: &ConnectionOptions) -> Result<(), AmqpError> {
        let key = ConnectionKey::new(urls, options)?;

        let connection = {
            let mut entries = self.entries.lock().await;

            let Some(entry) = entries.get_mut(&key) else {
                error!(key = key.as_str(), "connection released without a matching acquire");
                return Err(AmqpError::ReleaseWithoutAcquire(key.to_string()));
            };

            entry.references -= 1;
            if entry.references > 0 {
                debug!(references = entry.references, "amqp connection still in use");
                return Ok(());
            }

            entries.remove(&key).map(|entry| entry.connection)
        };

        if let Some(connection) = connection {
            debug!("closing amqp connection...");
            connection.close().await?;
            debug!("amqp connection closed");
        }

        Ok(())
    }

    /// Number of references held on the connection for `(urls, options)`.
    pub async fn references(&self, urls: &[String], options: &ConnectionOptions) -> usize {
        let Ok(key) = ConnectionKey::new(urls, options) else {
            return 0;
        };

        self.entries
            .lock()
            .await
            .get(&key)
            .map(|entry| entry.references)
            .unwrap_or_default()
    }
}
