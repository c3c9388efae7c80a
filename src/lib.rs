// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Flowline
//!
//! Message driven job engine on top of RabbitMQ. Consumers pull work from
//! the input queues, a bounded pool of workers runs a user [`Pipeline`] on
//! every message and the [`MessageBroker`] settles the result: outputs are
//! published and the input acked, transient failures are retried through a
//! TTL queue and permanent ones are parked on a failed queue.

mod consumer;
mod otel;
mod worker;

#[cfg(test)]
mod memory;

pub mod broker;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod flow;
pub mod message;
pub mod policy;
pub mod queue;
pub mod task_queue;
pub mod topology;

pub use broker::{Disposition, MessageBroker};
pub use client::{BrokerClient, ChannelStatus};
pub use codec::{JsonSerializer, Serializer};
pub use config::AppConfigs;
pub use engine::{Engine, EngineOptions, EngineStats};
pub use errors::{AmqpError, CodecError, ConfigError, EngineError};
pub use flow::{Flow, FlowError, FlowMonitor, Outcome, Pipeline, TracingMonitor};
pub use message::{Envelope, Message};
pub use policy::{FailurePolicy, FailureRoute};
