// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Broker
//!
//! High level send/receive/settle API of the engine, built on the resilient
//! [`BrokerClient`] and the per-queue [`FailurePolicy`].
//!
//! Retries use the broker's own TTL and dead-letter support: a retried message
//! is published to the retry exchange, waits in the retry queue for the
//! backoff period and is dead-lettered back into its input queue. The retry
//! count travels in the `x-retries` header; deliveries that lost it fall back
//! to the broker maintained `x-death` count.

use crate::{
    channel::{DeliveryStream, RawDelivery},
    client::BrokerClient,
    codec::Serializer,
    errors::{AmqpError, CodecError},
    message::{DeliveryTag, Envelope, Message},
    otel,
    policy::{FailurePolicy, FailureRoute},
    topology::{retry_exchange_name, Topology},
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header carrying the number of redeliveries of a message
pub const AMQP_HEADERS_X_RETRIES: &str = "x-retries";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// How a settling call left the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged and removed from the input queue.
    Acked,
    /// Published to the retry route; `attempt` is the new retry count.
    Retrying { attempt: u32 },
    /// Published to the failed route.
    Failed,
    /// No destination left; removed from the input queue without a copy.
    Dropped,
    /// Another clone of the message was settled first; nothing was done.
    AlreadySettled,
}

pub struct MessageBroker {
    client: BrokerClient,
    serializer: Arc<dyn Serializer>,
    exchange: String,
    retry_exchange: String,
    inputs: Vec<FailurePolicy>,
    outputs: Vec<String>,
}

impl MessageBroker {
    /// Creates the broker and provisions its topology.
    ///
    /// `inputs` are polled in the given order by [`MessageBroker::receive`];
    /// `outputs` are the routes of [`MessageBroker::send`] when a message
    /// names none.
    pub async fn new(
        client: BrokerClient,
        serializer: Arc<dyn Serializer>,
        exchange: &str,
        inputs: Vec<FailurePolicy>,
        outputs: Vec<String>,
    ) -> Result<MessageBroker, AmqpError> {
        let broker = MessageBroker {
            client,
            serializer,
            exchange: exchange.to_owned(),
            retry_exchange: retry_exchange_name(exchange),
            inputs,
            outputs,
        };

        broker.provision().await?;
        Ok(broker)
    }

    /// Topology derived from the exchange, inputs and outputs.
    pub fn topology(&self) -> Topology {
        Topology::for_engine(&self.exchange, &self.inputs, &self.outputs)
    }

    /// Declares the topology; the client replays it after every reconnect.
    pub async fn provision(&self) -> Result<(), AmqpError> {
        self.topology().install(&self.client).await
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn inputs(&self) -> &[FailurePolicy] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn policy(&self, queue: &str) -> Option<&FailurePolicy> {
        self.inputs.iter().find(|p| p.input_queue() == queue)
    }

    /// Publishes `message` to the main exchange.
    ///
    /// The routing key is `route` when given, else the message's own route,
    /// else every default output route.
    pub async fn send(&self, route: Option<&str>, message: &Message) -> Result<(), AmqpError> {
        self.send_in(&Context::current(), route, message).await
    }

    /// Same as [`MessageBroker::send`] with an explicit trace context.
    pub async fn send_in(
        &self,
        ctx: &Context,
        route: Option<&str>,
        message: &Message,
    ) -> Result<(), AmqpError> {
        let routes: Vec<&str> = match route.or(message.route()) {
            Some(route) => vec![route],
            None => self.outputs.iter().map(String::as_str).collect(),
        };

        if routes.is_empty() {
            return Err(AmqpError::NoRoute);
        }

        let body = self.serializer.serialize(message)?;
        let properties = self.properties(ctx, message);

        for key in routes {
            debug!(
                exchange = self.exchange.as_str(),
                routing_key = key,
                "publishing message"
            );
            self.client
                .publish(&self.exchange, key, &properties, &body)
                .await?;
        }

        Ok(())
    }

    fn properties(&self, ctx: &Context, message: &Message) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut headers);
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_RETRIES),
            AMQPValue::LongLongInt(message.envelope().retries().into()),
        );

        BasicProperties::default()
            .with_content_type(ShortString::from(self.serializer.content_type()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(message.envelope().timestamp())
            .with_headers(FieldTable::from(headers))
    }

    /// Polls the input queues in declared order and returns the first
    /// decodable message. Malformed deliveries met on the way are discarded.
    pub async fn receive(&self) -> Result<Option<Message>, AmqpError> {
        for policy in &self.inputs {
            let queue = policy.input_queue();

            while let Some((raw, generation)) = self.client.get(queue).await? {
                match self.decode(&raw, generation, queue) {
                    Ok(message) => return Ok(Some(message)),
                    Err(err) => {
                        warn!(queue, error = err.to_string(), "malformed message");
                        self.discard_malformed(&raw, generation, queue).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Turns a delivery of `source` into a message with a filled envelope.
    pub fn decode(
        &self,
        raw: &RawDelivery,
        generation: u64,
        source: &str,
    ) -> Result<Message, CodecError> {
        let mut message = self.serializer.deserialize(&raw.data)?;
        message.set_envelope(Envelope::received(
            source,
            DeliveryTag::new(raw.delivery_tag, generation),
            retries_of(&raw.properties),
            *raw.properties.timestamp(),
            raw.data.clone(),
            raw.properties.clone(),
        ));
        Ok(message)
    }

    /// Fail-fast rule for bodies that cannot be decoded: the delivery is
    /// forwarded untouched to the failed destination of `source` and removed
    /// from the input queue. Without a failed destination it is rejected
    /// without requeue.
    pub async fn discard_malformed(
        &self,
        raw: &RawDelivery,
        generation: u64,
        source: &str,
    ) -> Result<Disposition, AmqpError> {
        let (route, dead_lettered) = match self.policy(source) {
            Some(policy) => (policy.terminal_route(), dead_letters(policy)),
            None => (FailureRoute::Drop, false),
        };

        let delivery = DeliveryTag::new(raw.delivery_tag, generation);
        let disposition = self
            .forward(route, &raw.properties, &raw.data, delivery, dead_lettered)
            .await?;
        warn!(queue = source, disposition = ?disposition, "malformed message discarded");
        Ok(disposition)
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self, message: &Message) -> Result<Disposition, AmqpError> {
        let tag = delivery_of(message)?;
        if !message.envelope().settle() {
            return Ok(Disposition::AlreadySettled);
        }

        self.client.ack(tag.tag, tag.generation).await?;
        Ok(Disposition::Acked)
    }

    /// Retryable failure: counts one more attempt and sends the message to the
    /// retry route, or to the failed route once retries are exhausted.
    pub async fn reject(&self, message: &Message) -> Result<Disposition, AmqpError> {
        let tag = delivery_of(message)?;
        let policy = self.input_policy(message)?;
        if !message.envelope().settle() {
            return Ok(Disposition::AlreadySettled);
        }

        let route = policy.route_for(message.envelope().retries());
        let attempt = message.envelope().increment_retries();

        self.settle(policy, route, message, tag, attempt).await
    }

    /// Terminal failure: sends the message to the failed route without
    /// touching its retry count.
    pub async fn fail(&self, message: &Message) -> Result<Disposition, AmqpError> {
        let tag = delivery_of(message)?;
        let policy = self.input_policy(message)?;
        if !message.envelope().settle() {
            return Ok(Disposition::AlreadySettled);
        }

        let retries = message.envelope().retries();
        self.settle(policy, policy.terminal_route(), message, tag, retries)
            .await
    }

    async fn settle(
        &self,
        policy: &FailurePolicy,
        route: FailureRoute,
        message: &Message,
        tag: DeliveryTag,
        retries: u32,
    ) -> Result<Disposition, AmqpError> {
        let properties = with_retries(message.envelope().properties(), retries);
        let body = match message.envelope().body() {
            Some(body) => body.to_vec(),
            None => self.serializer.serialize(message)?,
        };

        let disposition = self
            .forward(route, &properties, &body, tag, dead_letters(policy))
            .await?;

        match disposition {
            Disposition::Retrying { .. } => {
                warn!(queue = message.envelope().source(), retries, "message will be retried")
            }
            Disposition::Failed => {
                error!(queue = message.envelope().source(), retries, "message failed permanently")
            }
            _ => {}
        }

        Ok(disposition)
    }

    /// Publishes a copy to `route`, then acks the original.
    ///
    /// `dead_letters` tells whether the input queue dead-letters rejected
    /// deliveries into its retry queue. A drop on such a queue is an ack,
    /// since a reject would come back through the retry queue.
    ///
    /// When the copy cannot be published a retry falls back to the input
    /// queue's dead-letter route; a failed copy is requeued so the terminal
    /// route is attempted again.
    async fn forward(
        &self,
        route: FailureRoute,
        properties: &BasicProperties,
        body: &[u8],
        delivery: DeliveryTag,
        dead_letters: bool,
    ) -> Result<Disposition, AmqpError> {
        let (exchange, key, disposition) = match route {
            FailureRoute::Retry(key) => {
                let attempt = retries_of(properties);
                (&self.retry_exchange, key, Disposition::Retrying { attempt })
            }
            FailureRoute::Fail(key) => (&self.exchange, key, Disposition::Failed),
            FailureRoute::Drop => {
                warn!(tag = delivery.tag, "no destination left, dropping message");
                if dead_letters {
                    self.client.ack(delivery.tag, delivery.generation).await?;
                } else {
                    self.client
                        .reject(delivery.tag, delivery.generation, false)
                        .await?;
                }
                return Ok(Disposition::Dropped);
            }
        };

        if let Err(err) = self.client.publish(exchange, &key, properties, body).await {
            error!(
                exchange = exchange.as_str(),
                routing_key = key.as_str(),
                error = err.to_string(),
                "failure to forward message"
            );
            let requeue = matches!(disposition, Disposition::Failed) || !dead_letters;
            if let Err(reject) = self
                .client
                .reject(delivery.tag, delivery.generation, requeue)
                .await
            {
                error!(error = reject.to_string(), "failure to reject message");
            }
            return Err(err);
        }

        self.client.ack(delivery.tag, delivery.generation).await?;
        Ok(disposition)
    }

    /// Gives a delivery back to its queue, as if it was never received.
    pub async fn requeue(&self, raw: &RawDelivery, generation: u64) -> Result<(), AmqpError> {
        self.client.reject(raw.delivery_tag, generation, true).await
    }

    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<(DeliveryStream, u64), AmqpError> {
        self.client.consume(queue, consumer_tag).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.client.cancel(consumer_tag).await
    }

    pub async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.client.qos(prefetch).await
    }

    /// Removes every ready message of `queue` and returns how many.
    pub async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.client.purge(queue).await
    }

    pub async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.client.message_count(queue).await
    }

    fn input_policy(&self, message: &Message) -> Result<&FailurePolicy, AmqpError> {
        let source = message.envelope().source().unwrap_or_default();
        self.policy(source)
            .ok_or_else(|| AmqpError::UnknownQueue(source.to_owned()))
    }
}

/// Whether the input queue of `policy` dead-letters into its retry queue.
fn dead_letters(policy: &FailurePolicy) -> bool {
    policy.retry_routing_key().is_some()
}

fn delivery_of(message: &Message) -> Result<DeliveryTag, AmqpError> {
    message
        .envelope()
        .delivery()
        .ok_or(AmqpError::MissingDeliveryTag)
}

/// Copy of `props` whose `x-retries` header is `retries`.
fn with_retries(props: &BasicProperties, retries: u32) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_X_RETRIES),
        AMQPValue::LongLongInt(retries.into()),
    );
    props.clone().with_headers(headers)
}

/// Retry count of a delivery: the `x-retries` header, else the count of the
/// first `x-death` entry, else 0.
fn retries_of(props: &BasicProperties) -> u32 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    if let Some(count) = headers.inner().get(AMQP_HEADERS_X_RETRIES).and_then(as_count) {
        return count;
    }

    match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(AMQPValue::FieldArray(deaths)) => match deaths.as_slice().first() {
            Some(AMQPValue::FieldTable(death)) => death
                .inner()
                .get(AMQP_HEADERS_COUNT)
                .and_then(as_count)
                .unwrap_or_default(),
            _ => 0,
        },
        _ => 0,
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        _ => return None,
    };
    u32::try_from(count).ok()
}
