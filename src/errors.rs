// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Job Engine
//!
//! This module provides the error types shared by the broker client, the
//! message broker, the codec, the engine and the configuration loader.
//! `AmqpError` covers every broker interaction and knows which failures are
//! transient channel faults that the resilient client may wait out.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// `ChannelClosed` is the only recoverable variant: the broker client parks
/// the caller until the channel is recovered and then retries the operation.
/// Every other variant is reported to the caller as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel or its connection went away; the operation may be retried
    /// once the channel is recovered
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The client was shut down while the operation was pending
    #[error("broker client closed")]
    ClientClosed,

    /// The delivery tag was issued by a channel that no longer exists
    #[error("delivery tag `{0}` belongs to a closed channel")]
    StaleDelivery(u64),

    /// The message was not received from the broker and carries no delivery tag
    #[error("message has no delivery tag")]
    MissingDeliveryTag,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// No routing key was given and no default output route is configured
    #[error("no route for outgoing message")]
    NoRoute,

    /// The queue is not one of the configured input queues
    #[error("queue `{0}` is not a configured input")]
    UnknownQueue(String),

    /// Error fetching a message with basic.get
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error encoding an outgoing message body
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AmqpError {
    /// Whether the failure is a transient channel fault the client recovers from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AmqpError::ChannelClosed(_))
    }

    /// Maps a lapin error either to `ChannelClosed` when the channel or the
    /// connection underneath it is gone, or to the operation specific error.
    pub(crate) fn from_lapin<F>(err: lapin::Error, fatal: F) -> AmqpError
    where
        F: FnOnce(String) -> AmqpError,
    {
        match err {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidChannel(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_) => AmqpError::ChannelClosed(err.to_string()),
            other => fatal(other.to_string()),
        }
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        AmqpError::from_lapin(err, |_| AmqpError::InternalError)
    }
}

/// Errors raised by a [`Serializer`](crate::codec::Serializer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error encoding a message payload
    #[error("failure to encode payload: {0}")]
    EncodePayloadError(String),
}

/// Errors raised while starting or driving the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `start` was called on a running engine
    #[error("engine already started")]
    AlreadyStarted,

    /// A broker operation failed during startup
    #[error(transparent)]
    Broker(#[from] AmqpError),

    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialized
    #[error("failure to load configuration: {0}")]
    Load(String),

    /// The configuration was read but is not usable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_channel_closed_is_recoverable() {
        assert!(AmqpError::ChannelClosed("gone".to_owned()).is_recoverable());
        assert!(!AmqpError::ClientClosed.is_recoverable());
        assert!(!AmqpError::PublishingError("x".to_owned()).is_recoverable());
        assert!(!AmqpError::StaleDelivery(3).is_recoverable());
    }

    #[test]
    fn lapin_state_errors_become_channel_closed() {
        let err = lapin::Error::InvalidChannel(7);
        let mapped = AmqpError::from_lapin(err, AmqpError::PublishingError);
        assert!(mapped.is_recoverable());

        let err = lapin::Error::ChannelsLimitReached;
        let mapped = AmqpError::from_lapin(err, AmqpError::PublishingError);
        assert!(matches!(mapped, AmqpError::PublishingError(_)));

        let converted: AmqpError = lapin::Error::InvalidChannel(2).into();
        assert!(converted.is_recoverable());
        let converted: AmqpError = lapin::Error::ChannelsLimitReached.into();
        assert_eq!(converted, AmqpError::InternalError);
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("jobs".to_owned(), "orders".to_owned());
        assert_eq!(
            err.to_string(),
            "failure to bind exchange `jobs` to queue `orders`"
        );
    }
}
