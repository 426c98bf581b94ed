// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! The publishing side of a topology. `create` borrows a shared connection
//! from the `ConnectionRegistry`, opens its own channel, provisions the
//! topology and keeps a `PublishPipeline` over that channel until `close`.

use crate::{
    broker::{BrokerChannel, Delivery},
    configs::ConnectionOptions,
    connection::ConnectionRegistry,
    contract::TopologyDescription,
    errors::{AmqpError, PublishError},
    publisher::{PublishOptions, PublishPipeline},
    topology,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

const CLIENT: &str = "AmqpClient";

/// Publishes validated messages through the publishers of one topology.
pub struct AmqpClient {
    registry: Arc<ConnectionRegistry>,
    urls: Vec<String>,
    options: ConnectionOptions,
    channel: Arc<dyn BrokerChannel>,
    pipeline: PublishPipeline,
    closed: AtomicBool,
}

impl AmqpClient {
    /// Connects and provisions `topology`.
    ///
    /// A connection or provisioning failure aborts creation and returns the
    /// connection reference to the registry.
    pub async fn create(
        registry: Arc<ConnectionRegistry>,
        topology: Arc<TopologyDescription>,
        urls: Vec<String>,
        options: ConnectionOptions,
    ) -> Result<AmqpClient, AmqpError> {
        let connection = registry.acquire(&urls, &options).await?;

        let setup = async {
            let channel = connection.create_channel().await?;
            if let Err(err) = topology::provision(channel.clone(), &topology).await {
                if let Err(close) = channel.close().await {
                    warn!(error = close.to_string(), "failure to close the setup channel");
                }
                return Err(AmqpError::from(err));
            }
            Ok(channel)
        };

        let channel = match setup.await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "failure to create amqp client");
                if let Err(release) = registry.release(&urls, &options).await {
                    warn!(error = release.to_string(), "failure to release the connection");
                }
                return Err(err);
            }
        };

        debug!("amqp client ready");

        Ok(AmqpClient {
            pipeline: PublishPipeline::new(channel.clone(), topology),
            registry,
            urls,
            options,
            channel,
            closed: AtomicBool::new(false),
        })
    }

    /// Publishes `payload` through the named publisher.
    ///
    /// Never panics: validation failures come back as
    /// `PublishError::Validation`, a closed client as
    /// `PublishError::Technical(AmqpError::ClosedError)`.
    pub async fn publish<T: Serialize>(
        &self,
        publisher: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(AmqpError::ClosedError(CLIENT.to_owned()).into());
        }

        let payload = serde_json::to_value(payload).map_err(|err| AmqpError::InternalError(err.to_string()))?;
        self.pipeline.publish(publisher, &payload, options).await
    }

    /// Fetches one message from `queue` without subscribing.
    ///
    /// The message is left unacknowledged on the client's channel.
    pub async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClosedError(CLIENT.to_owned()));
        }

        self.channel.get(queue).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the channel and releases the connection. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing amqp client...");
        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "failure to close the client channel");
        }

        self.registry.release(&self.urls, &self.options).await?;
        debug!("amqp client closed");
        Ok(())
    }
}

impl Drop for AmqpClient {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!("amqp client dropped outside a runtime, the connection reference leaks");
            return;
        };

        warn!("amqp client dropped without close, releasing the connection");
        let channel = self.channel.clone();
        let registry = self.registry.clone();
        let urls = std::mem::take(&mut self.urls);
        let options = std::mem::take(&mut self.options);

        handle.spawn(async move {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close the client channel");
            }
            if let Err(err) = registry.release(&urls, &options).await {
                error!(error = err.to_string(), "failure to release the connection");
            }
        });
    }
}
