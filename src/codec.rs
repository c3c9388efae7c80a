// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Codec
//!
//! The broker layer turns bodies into [`Message`]s through the [`Serializer`]
//! trait. Only the payload and the tracing path travel in the body; the retry
//! count travels in headers and the source queue and delivery tag are filled
//! in locally after receipt.

use crate::{errors::CodecError, message::Message};
use serde::{Deserialize, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes message bodies.
#[cfg_attr(test, mockall::automock)]
pub trait Serializer: Send + Sync {
    /// Content type advertised in the AMQP properties of outgoing messages.
    fn content_type(&self) -> &'static str;

    fn serialize(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

    fn deserialize(&self, body: &[u8]) -> Result<Message, CodecError>;
}

#[derive(Serialize)]
struct WireRef<'a> {
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tracing: &'a [String],
    payload: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct WireOwned {
    #[serde(default)]
    tracing: Vec<String>,
    payload: serde_json::Value,
}

/// JSON body codec: `{"tracing": ["id", ...], "payload": ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&WireRef {
            tracing: message.tracing_path(),
            payload: message.payload(),
        })
        .map_err(|err| CodecError::EncodePayloadError(err.to_string()))
    }

    fn deserialize(&self, body: &[u8]) -> Result<Message, CodecError> {
        let wire: WireOwned = serde_json::from_slice(body)
            .map_err(|err| CodecError::ParsePayloadError(err.to_string()))?;
        Ok(Message::from_wire(wire.payload, wire.tracing))
    }
}
