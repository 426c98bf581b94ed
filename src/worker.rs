// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Worker
//!
//! The consuming side of a topology. `create` provisions the topology once on
//! a setup channel, then starts one `ConsumePipeline` per registered handler,
//! each on its own channel of the shared connection.
//!
//! Closing stops every consumer, waits for in-flight handlers (optionally
//! bounded by a drain deadline), closes the channels and finally releases the
//! connection reference.

use crate::{
    broker::BrokerConnection,
    configs::ConnectionOptions,
    connection::ConnectionRegistry,
    contract::TopologyDescription,
    dispatcher::{ConsumePipeline, ConsumerOptions},
    errors::AmqpError,
    handler::Handler,
    topology,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

/// A handler and its consume options, registered for one consumer.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub handler: Handler,
    pub options: ConsumerOptions,
}

impl ConsumerRegistration {
    pub fn new(handler: Handler) -> ConsumerRegistration {
        ConsumerRegistration {
            handler,
            options: ConsumerOptions::default(),
        }
    }

    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<Handler> for ConsumerRegistration {
    fn from(handler: Handler) -> Self {
        ConsumerRegistration::new(handler)
    }
}

/// Runs the registered handlers against the consumers of one topology.
pub struct AmqpWorker {
    registry: Arc<ConnectionRegistry>,
    urls: Vec<String>,
    options: ConnectionOptions,
    pipelines: Vec<ConsumePipeline>,
    closed: AtomicBool,
}

impl AmqpWorker {
    /// Connects, provisions `topology` and starts a consumer per handler.
    ///
    /// Handlers are keyed by consumer name. A handler for a consumer the
    /// topology does not declare is an error; topology consumers without a
    /// handler are not started.
    pub async fn create(
        registry: Arc<ConnectionRegistry>,
        topology: Arc<TopologyDescription>,
        urls: Vec<String>,
        options: ConnectionOptions,
        handlers: BTreeMap<String, ConsumerRegistration>,
    ) -> Result<AmqpWorker, AmqpError> {
        if let Some(name) = handlers.keys().find(|name| topology.get_consumer(name).is_none()) {
            error!(consumer = %name, "handler registered for an unknown consumer");
            return Err(AmqpError::UnknownConsumer(name.clone()));
        }

        for name in topology.consumers().keys().filter(|name| !handlers.contains_key(*name)) {
            debug!(consumer = %name, "no handler registered, consumer not started");
        }

        let connection = registry.acquire(&urls, &options).await?;

        match start(connection, &topology, handlers).await {
            Ok(pipelines) => {
                debug!(consumers = pipelines.len(), "amqp worker ready");
                Ok(AmqpWorker {
                    registry,
                    urls,
                    options,
                    pipelines,
                    closed: AtomicBool::new(false),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to create amqp worker");
                if let Err(release) = registry.release(&urls, &options).await {
                    warn!(error = release.to_string(), "failure to release the connection");
                }
                Err(err)
            }
        }
    }

    /// Names of the running consumers.
    pub fn consumers(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name()).collect()
    }

    /// Whether the named consumer is still receiving deliveries. A consumer
    /// stops on its own when the broker cancels its subscription.
    pub fn is_running(&self, consumer: &str) -> bool {
        self.pipelines
            .iter()
            .any(|p| p.name() == consumer && p.is_running())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops every consumer and waits for all in-flight handlers.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown(None).await
    }

    /// Like `close`, but gives in-flight handlers at most `drain` to finish.
    /// Deliveries of handlers still running after that are requeued by the
    /// broker.
    pub async fn close_with_deadline(&self, drain: Duration) -> Result<(), AmqpError> {
        self.shutdown(Some(drain)).await
    }

    async fn shutdown(&self, drain: Option<Duration>) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing amqp worker...");
        let results = futures_util::future::join_all(self.pipelines.iter().map(|p| p.close(drain))).await;
        for (pipeline, result) in self.pipelines.iter().zip(results) {
            if let Err(err) = result {
                warn!(error = err.to_string(), consumer = pipeline.name(), "failure to close consumer");
            }
        }

        self.registry.release(&self.urls, &self.options).await?;
        debug!("amqp worker closed");
        Ok(())
    }
}

async fn start(
    connection: Arc<dyn BrokerConnection>,
    topology: &TopologyDescription,
    handlers: BTreeMap<String, ConsumerRegistration>,
) -> Result<Vec<ConsumePipeline>, AmqpError> {
    let setup = connection.create_channel().await?;
    let provisioned = topology::provision(setup.clone(), topology).await;
    if let Err(err) = setup.close().await {
        warn!(error = err.to_string(), "failure to close the setup channel");
    }
    provisioned?;

    let mut pipelines = Vec::with_capacity(handlers.len());
    for (name, registration) in handlers {
        let started = async {
            let channel = connection.create_channel().await?;
            ConsumePipeline::start(channel, topology, &name, registration.handler, registration.options).await
        };

        match started.await {
            Ok(pipeline) => pipelines.push(pipeline),
            Err(err) => {
                error!(error = err.to_string(), consumer = %name, "failure to start consumer");
                for pipeline in &pipelines {
                    if let Err(close) = pipeline.close(None).await {
                        warn!(error = close.to_string(), consumer = pipeline.name(), "failure to close consumer");
                    }
                }
                return Err(err);
            }
        }
    }

    Ok(pipelines)
}

impl Drop for AmqpWorker {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!("amqp worker dropped outside a runtime, the connection reference leaks");
            return;
        };

        warn!("amqp worker dropped without close, stopping consumers");
        let pipelines = std::mem::take(&mut self.pipelines);
        let registry = self.registry.clone();
        let urls = std::mem::take(&mut self.urls);
        let options = std::mem::take(&mut self.options);

        handle.spawn(async move {
            for pipeline in &pipelines {
                if let Err(err) = pipeline.close(None).await {
                    warn!(error = err.to_string(), consumer = pipeline.name(), "failure to close consumer");
                }
            }
            if let Err(err) = registry.release(&urls, &options).await {
                error!(error = err.to_string(), "failure to release the connection");
            }
        });
    }
}
