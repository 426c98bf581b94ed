// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin implementation of the broker abstraction. `LapinConnectionFactory`
//! establishes connections to the RabbitMQ server, `LapinChannel` carries the
//! declarations, publishes and acknowledgements of one pipeline.

use crate::{
    broker::{BrokerChannel, BrokerConnection, ConnectionFactory, Delivery, DeliveryStream, QueueOptions},
    configs::ConnectionOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Opens lapin connections, trying each url in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnectionFactory;

impl LapinConnectionFactory {
    pub fn new() -> Arc<LapinConnectionFactory> {
        Arc::new(LapinConnectionFactory)
    }

    fn properties(options: &ConnectionOptions) -> ConnectionProperties {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        for (key, value) in &options.client_properties {
            properties
                .client_properties
                .insert(ShortString::from(key.clone()), headers::json_to_amqp(value));
        }

        properties
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(
        &self,
        urls: &[String],
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut last_error = "no broker url configured".to_owned();

        for url in urls {
            let uri = options.apply_to_uri(url);
            match Connection::connect(&uri, Self::properties(options)).await {
                Ok(conn) => {
                    debug!("amqp connected");
                    return Ok(Arc::new(LapinConnection { conn }));
                }
                Err(err) => {
                    warn!(error = err.to_string(), "failure to connect, trying next url");
                    last_error = err.to_string();
                }
            }
        }

        error!(error = last_error, "failure to connect");
        Err(AmqpError::ConnectionError(last_error))
    }
}

/// A physical lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        debug!("channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

/// A lapin channel with publisher confirms enabled.
pub struct LapinChannel {
    channel: Channel,
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.field_table(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(name.to_owned(), err.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| AmqpError::BindingExchangeToQueueError {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| AmqpError::BindingExchangeToExchangeError {
                origin: source.to_owned(),
                destination: destination.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting publisher confirm");
            AmqpError::PublishingError(err.to_string())
        })?;

        if confirmation.is_nack() {
            error!(exchange, routing_key, "message was nacked by the broker");
            return Err(AmqpError::PublishingError(format!(
                "broker nacked message to `{}` with routing key `{}`",
                exchange, routing_key
            )));
        }

        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned(), err.to_string())
            })?;

        // lapin ends the stream when the server cancels the subscription
        let deliveries = consumer
            .map(|result| {
                result
                    .map(|delivery| Some(into_delivery(delivery)))
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .chain(stream::once(async { Ok(None) }));

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        self.channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map(|msg| msg.map(|msg| into_delivery(msg.delivery)))
            .map_err(|err| AmqpError::GetMessageError(queue.to_owned(), err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}
