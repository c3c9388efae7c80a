// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them.
//!
//! For the job engine the topology is derived from the failure policies of the
//! input queues: every input queue gets a retry queue that holds rejected
//! messages for the backoff period and dead-letters them back, and a failed
//! queue that keeps exhausted messages for inspection.

use crate::{
    client::BrokerClient,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    policy::FailurePolicy,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Suffix of the exchange retried messages are published to.
pub const RETRY_EXCHANGE_SUFFIX: &str = ".retry";

/// One recorded declaration, replayed by the broker client after a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

impl Declaration {
    /// Two declarations describe the same broker object.
    pub(crate) fn same_object(&self, other: &Declaration) -> bool {
        match (self, other) {
            (Declaration::Exchange(a), Declaration::Exchange(b)) => a.name == b.name,
            (Declaration::Queue(a), Declaration::Queue(b)) => a.name == b.name,
            (Declaration::Binding(a), Declaration::Binding(b)) => a == b,
            _ => false,
        }
    }
}

/// Exchanges, queues and bindings to install, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Builds the engine topology.
    ///
    /// With main exchange `E`:
    /// - `E` and `E.retry`, both direct and durable;
    /// - per input queue `q`: `q` bound to `E` with key `q`, dead-lettering
    ///   into `E.retry` with the retry key when retry is enabled;
    /// - the retry queue bound to `E.retry`, holding messages for the backoff
    ///   and dead-lettering them into `E` with key `q`;
    /// - the failed queue bound to `E` with the failed key;
    /// - one queue per output route bound to `E`.
    pub fn for_engine(exchange: &str, inputs: &[FailurePolicy], outputs: &[String]) -> Topology {
        let retry_exchange = retry_exchange_name(exchange);

        let mut topology = Topology::new()
            .exchange(ExchangeDefinition::new(exchange).direct().durable())
            .exchange(ExchangeDefinition::new(&retry_exchange).direct().durable());

        for policy in inputs {
            let queue = policy.input_queue();
            let mut input = QueueDefinition::new(queue).durable();

            if let Some(retry_key) = policy.retry_routing_key() {
                input = input.dead_letter(&retry_exchange, retry_key);

                topology = topology
                    .queue(
                        QueueDefinition::new(retry_key)
                            .durable()
                            .ttl(backoff_millis(policy))
                            .dead_letter(exchange, queue),
                    )
                    .binding(
                        QueueBinding::new(retry_key)
                            .exchange(&retry_exchange)
                            .routing_key(retry_key),
                    );
            }

            if let Some(failed_key) = policy.failed_routing_key() {
                topology = topology
                    .queue(QueueDefinition::new(failed_key).durable())
                    .binding(
                        QueueBinding::new(failed_key)
                            .exchange(exchange)
                            .routing_key(failed_key),
                    );
            }

            topology = topology
                .queue(input)
                .binding(QueueBinding::new(queue).exchange(exchange).routing_key(queue));
        }

        for output in outputs {
            topology = topology
                .queue(QueueDefinition::new(output).durable())
                .binding(QueueBinding::new(output).exchange(exchange).routing_key(output));
        }

        topology
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology; a later definition of the same
    /// queue replaces the earlier one.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn binding(mut self, binding: QueueBinding) -> Self {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Installs the topology through the broker client.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    ///
    /// Every declaration is recorded by the client and replayed after a
    /// reconnect.
    pub async fn install(&self, client: &BrokerClient) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            debug!("creating exchange: {}", exchange.name);
            client.declare_exchange(exchange.clone()).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            client.declare_queue(queue.clone()).await?;
        }

        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            client.bind_queue(binding.clone()).await?;
        }

        debug!("topology installed");

        Ok(())
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }
}

/// Name of the exchange retried messages are published to.
pub fn retry_exchange_name(exchange: &str) -> String {
    format!("{exchange}{RETRY_EXCHANGE_SUFFIX}")
}

fn backoff_millis(policy: &FailurePolicy) -> i32 {
    i32::try_from(policy.backoff().as_millis()).unwrap_or(i32::MAX)
}
