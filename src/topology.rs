// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Provisioning
//!
//! This module declares a `TopologyDescription` on the broker. Provisioning
//! runs in three ordered phases, since each phase references names declared by
//! the previous one:
//!
//! 1. exchanges
//! 2. queues (with merged dead-letter arguments, plus derived wait queues)
//! 3. bindings (declared ones, plus the DLX -> main queue retry bindings)
//!
//! Declarations within a phase run concurrently and every failure is
//! collected into one `AggregateError`. Re-running against an already
//! provisioned broker succeeds as long as the definitions did not change.

use crate::{
    broker::{BrokerChannel, QueueOptions},
    contract::{BindingDefinition, TopologyDescription},
    errors::{AggregateError, AmqpError, ProvisionPhase},
    queue::QueueDefinition,
};
use futures_util::future::join_all;
use lapin::types::FieldTable;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Provisions `description` through `channel`.
pub async fn provision(
    channel: Arc<dyn BrokerChannel>,
    description: &TopologyDescription,
) -> Result<(), AggregateError> {
    AmqpTopology::new(channel, description).install().await
}

/// Declares one topology description on the broker.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn BrokerChannel>,
    description: &'tp TopologyDescription,
}

/// A queue binding resolved to broker names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ResolvedBinding {
    queue: String,
    exchange: String,
    routing_key: String,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<dyn BrokerChannel>, description: &'tp TopologyDescription) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            description,
        }
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Stops after the first phase that reports failures, returning all of
    /// that phase's failures.
    pub async fn install(&self) -> Result<(), AggregateError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.install_bindings().await?;

        debug!("topology was installed");
        Ok(())
    }

    async fn install_exchanges(&self) -> Result<(), AggregateError> {
        let declarations = self.description.exchanges.values().map(|exch| async move {
            debug!("creating exchange: {}", exch.name);

            self.channel.assert_exchange(exch).await.inspect_err(|err| {
                error!(error = err.to_string(), name = %exch.name, "error to declare the exchange")
            })
        });

        collect(ProvisionPhase::Exchanges, join_all(declarations).await)
    }

    async fn install_queues(&self) -> Result<(), AggregateError> {
        let mut failures = vec![];
        let mut queues: BTreeMap<&str, &QueueDefinition> = BTreeMap::new();

        for def in self.description.queues.values() {
            match self.check_queue(def) {
                Ok(()) => {
                    queues.insert(&def.name, def);
                }
                Err(err) => {
                    error!(error = err.to_string(), name = %def.name, "invalid queue definition");
                    failures.push(err);
                }
            }
        }

        let declarations = queues.values().map(|def| self.declare_queue(def));
        failures.extend(
            join_all(declarations)
                .await
                .into_iter()
                .filter_map(Result::err),
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError {
                phase: ProvisionPhase::Queues,
                errors: failures,
            })
        }
    }

    /// Local checks that must pass before the queue reaches the broker.
    fn check_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        def.validate()?;

        if let Some(dlc) = &def.dead_letter {
            if !self.description.declares_exchange(&dlc.exchange.name) {
                return Err(AmqpError::MissingDeadLetterExchange {
                    queue: def.name.clone(),
                    exchange: dlc.exchange.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Declares a queue and, for TTL-backoff queues with a DLX, its wait queue.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let options = QueueOptions {
            durable: def.durable,
            auto_delete: def.auto_delete,
            exclusive: def.exclusive,
        };

        self.channel
            .assert_queue(&def.name, options, def.declare_arguments())
            .await
            .inspect_err(|err| error!(error = err.to_string(), name = %def.name, "error to declare the queue"))?;

        if let Some(args) = def.wait_queue_arguments() {
            let wait_queue = def.wait_queue_name();
            debug!("creating wait queue: {}", wait_queue);

            let options = QueueOptions {
                durable: def.durable,
                auto_delete: false,
                exclusive: false,
            };

            self.channel
                .assert_queue(&wait_queue, options, args)
                .await
                .inspect_err(|err| {
                    error!(error = err.to_string(), name = %wait_queue, "failure to declare wait queue")
                })?;
        }

        debug!("queue: {} was created", def.name);
        Ok(())
    }

    async fn install_bindings(&self) -> Result<(), AggregateError> {
        let mut queue_bindings = BTreeMap::new();
        let mut exchange_bindings = vec![];

        for binding in self.description.bindings.values() {
            match binding {
                BindingDefinition::Queue(b) => {
                    queue_bindings.insert(
                        ResolvedBinding {
                            queue: b.queue_name.clone(),
                            exchange: b.exchange_name.clone(),
                            routing_key: b.routing_key.clone().unwrap_or_default(),
                        },
                        b.arguments.clone(),
                    );
                }
                BindingDefinition::Exchange(b) => exchange_bindings.push(b),
            }
        }

        // expired wait-queue messages come back through the DLX keyed by queue name
        for def in self.description.queues.values() {
            if let (true, Some(dlc)) = (def.has_wait_queue(), &def.dead_letter) {
                queue_bindings
                    .entry(ResolvedBinding {
                        queue: def.name.clone(),
                        exchange: dlc.exchange.name.clone(),
                        routing_key: def.name.clone(),
                    })
                    .or_default();
            }
        }

        let queue_futures = queue_bindings.iter().map(|(binding, args)| async move {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue, binding.exchange, binding.routing_key
            );

            self.channel
                .bind_queue(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    FieldTable::from(args.clone()),
                )
                .await
                .inspect_err(|err| error!(error = err.to_string(), "error to bind queue to exchange"))
        });

        let exchange_futures = exchange_bindings.into_iter().map(|b| async move {
            let routing_key = b.routing_key.clone().unwrap_or_default();
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                b.destination, b.source, routing_key
            );

            self.channel
                .bind_exchange(
                    &b.destination,
                    &b.source,
                    &routing_key,
                    FieldTable::from(b.arguments.clone()),
                )
                .await
                .inspect_err(|err| error!(error = err.to_string(), "error to bind exchange to exchange"))
        });

        let (queue_results, exchange_results) =
            futures_util::future::join(join_all(queue_futures), join_all(exchange_futures)).await;

        collect(
            ProvisionPhase::Bindings,
            queue_results.into_iter().chain(exchange_results).collect(),
        )
    }
}

fn collect(phase: ProvisionPhase, results: Vec<Result<(), AmqpError>>) -> Result<(), AggregateError> {
    let errors: Vec<AmqpError> = results.into_iter().filter_map(Result::err).collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AggregateError { phase, errors })
    }
}
