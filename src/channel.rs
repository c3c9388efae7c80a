// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the wire transport the broker client drives: an
//! [`AmqpChannel`] exposing the channel operations the engine needs and a
//! [`Connector`] that opens a fresh channel, used both at startup and after a
//! connection loss. The lapin implementations live here too.

use crate::{
    client::RecoveryTrigger,
    config::{AppConfigs, RabbitMQConfig},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A message handed out by the broker, detached from the channel object that
/// produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> Self {
        RawDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Stream of pushed deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

/// The channel operations used by the engine.
///
/// Implementations report a lost channel or connection as
/// [`AmqpError::ChannelClosed`]; every other error is treated as final.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Publishes and waits for the broker confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError>;

    async fn basic_get(&self, queue: &str) -> Result<Option<RawDelivery>, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Removes every ready message and returns how many were removed.
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Number of ready messages in the queue.
    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Best effort shutdown of the channel and its connection.
    async fn close(&self);
}

/// Opens channels.
///
/// `on_loss` must be fired when the connection behind the returned channel
/// fails, so the broker client can start recovering without waiting for an
/// operation to hit the dead channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, on_loss: RecoveryTrigger) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Opens lapin connections with publisher confirms enabled.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(uri: &str, connection_name: &str) -> LapinConnector {
        LapinConnector {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }

    /// Builds a connector from the application configuration.
    pub fn from_configs(cfg: &AppConfigs) -> LapinConnector {
        LapinConnector::new(&cfg.rabbitmq.uri(), &cfg.app.name)
    }

    pub fn from_rabbitmq(cfg: &RabbitMQConfig, connection_name: &str) -> LapinConnector {
        LapinConnector::new(&cfg.uri(), connection_name)
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, on_loss: RecoveryTrigger) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            on_loss.fire();
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
        debug!("channel created");

        Ok(Arc::new(LapinChannel {
            connection: conn,
            channel,
        }))
    }
}

/// A lapin channel together with the connection that owns it.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let failure = |reason: String| {
            error!(error = reason, exchange, routing_key, "error publishing message");
            AmqpError::PublishingError(format!("{exchange}/{routing_key}"))
        };

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::from_lapin(err, failure))?;

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::from_lapin(err, failure))?;

        if confirmation.is_nack() {
            return Err(failure("broker nacked the message".to_owned()));
        }

        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<RawDelivery>, AmqpError> {
        let msg = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|err| AmqpError::from_lapin(err, |_| AmqpError::GetMessageError(queue.to_owned())))?;

        Ok(msg.map(|m| RawDelivery::from(m.delivery)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::from_lapin(err, |_| AmqpError::AckMessageError))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::from_lapin(err, |_| AmqpError::RejectMessageError))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
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
                AmqpError::from_lapin(err, |_| AmqpError::BindingConsumerError(queue.to_owned()))
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(RawDelivery::from)
                    .map_err(|err| AmqpError::from_lapin(err, AmqpError::ConsumerError))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                AmqpError::from_lapin(err, |_| AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            })
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::from_lapin(err, AmqpError::QoSDeclarationError))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::from_lapin(err, |_| AmqpError::DeclareExchangeError(def.name.clone()))
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                AmqpError::from_lapin(err, |_| AmqpError::DeclareQueueError(def.name.clone()))
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::from_lapin(err, |_| {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })
            })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| AmqpError::from_lapin(err, |_| AmqpError::PurgeQueueError(queue.to_owned())))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|q| q.message_count())
            .map_err(|err| AmqpError::from_lapin(err, |_| AmqpError::DeclareQueueError(queue.to_owned())))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!(error = err.to_string(), "channel already closed");
        }
        if let Err(err) = self.connection.close(200, "closing").await {
            debug!(error = err.to_string(), "connection already closed");
        }
    }
}
