// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Envelopes
//!
//! A [`Message`] is one unit of work: a JSON payload, the tracing path that
//! links it to the messages that caused it, and an [`Envelope`] with the
//! transport metadata the broker layer needs to settle it.

use crate::errors::CodecError;
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// Broker handle for one delivery, scoped to the channel generation that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub tag: u64,
    pub generation: u64,
}

impl DeliveryTag {
    pub fn new(tag: u64, generation: u64) -> Self {
        DeliveryTag { tag, generation }
    }
}

/// Transport metadata of a message.
///
/// Populated by the broker layer when a delivery is decoded. User pipelines
/// can read it but have no way to change the delivery tag or the retry count.
/// Clones share the settled flag and the retry count of the delivery.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    source: Option<String>,
    delivery: Option<DeliveryTag>,
    retries: Arc<AtomicU32>,
    timestamp: u64,
    body: Option<Arc<Vec<u8>>>,
    properties: BasicProperties,
    settled: Arc<AtomicBool>,
}

impl Envelope {
    pub(crate) fn received(
        source: &str,
        delivery: DeliveryTag,
        retries: u32,
        timestamp: Option<u64>,
        body: Vec<u8>,
        properties: BasicProperties,
    ) -> Envelope {
        Envelope {
            source: Some(source.to_owned()),
            delivery: Some(delivery),
            retries: Arc::new(AtomicU32::new(retries)),
            timestamp: timestamp.unwrap_or_else(now_secs),
            body: Some(Arc::new(body)),
            properties,
            settled: Arc::default(),
        }
    }

    /// The queue the message was read from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn delivery(&self) -> Option<DeliveryTag> {
        self.delivery
    }

    /// Number of redeliveries so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Creation time in seconds since the unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The raw body as it arrived on the wire.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref().map(Vec::as_slice)
    }

    /// The AMQP properties as they arrived on the wire.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Marks the delivery as settled. Returns `false` when some other clone of
    /// the message already settled it.
    pub(crate) fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Counts one more retry and returns the new count.
    pub(crate) fn increment_retries(&self) -> u32 {
        let previous = self
            .retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or_else(|n| n);
        previous.saturating_add(1)
    }
}

/// A unit of work flowing through the engine.
#[derive(Debug, Clone)]
pub struct Message {
    payload: serde_json::Value,
    tracing: Vec<String>,
    route: Option<String>,
    envelope: Envelope,
}

impl Message {
    /// Creates an outgoing message with an empty envelope.
    pub fn new(payload: serde_json::Value) -> Message {
        Message {
            payload,
            tracing: vec![],
            route: None,
            envelope: Envelope {
                timestamp: now_secs(),
                ..Envelope::default()
            },
        }
    }

    /// Creates an outgoing message from any serializable value.
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Message, CodecError> {
        serde_json::to_value(payload)
            .map(Message::new)
            .map_err(|err| CodecError::EncodePayloadError(err.to_string()))
    }

    pub(crate) fn from_wire(payload: serde_json::Value, tracing: Vec<String>) -> Message {
        Message {
            payload,
            tracing,
            route: None,
            envelope: Envelope::default(),
        }
    }

    /// Appends a correlation id to the tracing path.
    pub fn with_tracing_id(mut self, id: impl Into<String>) -> Self {
        self.tracing.push(id.into());
        self
    }

    /// Replaces the whole tracing path.
    pub fn with_tracing_path(mut self, path: Vec<String>) -> Self {
        self.tracing = path;
        self
    }

    /// Routing key used when the message is sent without an explicit one.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| CodecError::ParsePayloadError(err.to_string()))
    }

    pub fn tracing_path(&self) -> &[String] {
        &self.tracing
    }

    /// The most recent correlation id, if any.
    pub fn tracing_id(&self) -> Option<&str> {
        self.tracing.last().map(String::as_str)
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub(crate) fn set_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }

    /// Copies the tracing path of `parent` when this message has none.
    pub(crate) fn inherit_tracing(&mut self, parent: &Message) {
        if self.tracing.is_empty() {
            self.tracing = parent.tracing.clone();
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn typed_payload_helpers() {
        let order = Order {
            id: 4,
            sku: "A-1".to_owned(),
        };
        let msg = Message::from_payload(&order).unwrap();
        assert_eq!(msg.payload(), &json!({"id": 4, "sku": "A-1"}));
        assert_eq!(msg.payload_as::<Order>().unwrap(), order);
        assert!(msg.payload_as::<Vec<u8>>().is_err());
    }

    #[test]
    fn tracing_id_is_last_element_of_path() {
        let msg = Message::new(json!(null))
            .with_tracing_id("root")
            .with_tracing_id("child");
        assert_eq!(msg.tracing_path(), ["root", "child"]);
        assert_eq!(msg.tracing_id(), Some("child"));
    }

    #[test]
    fn inherit_keeps_own_tracing() {
        let parent = Message::new(json!(1)).with_tracing_id("abc");
        let mut orphan = Message::new(json!(2));
        let mut owned = Message::new(json!(3)).with_tracing_id("xyz");

        orphan.inherit_tracing(&parent);
        owned.inherit_tracing(&parent);

        assert_eq!(orphan.tracing_id(), Some("abc"));
        assert_eq!(owned.tracing_id(), Some("xyz"));
    }

    #[test]
    fn clones_share_settlement() {
        let mut msg = Message::new(json!({}));
        msg.set_envelope(Envelope::received(
            "q",
            DeliveryTag::new(1, 1),
            0,
            None,
            b"{}".to_vec(),
            BasicProperties::default(),
        ));
        let copy = msg.clone();

        assert!(msg.envelope().settle());
        assert!(copy.envelope().is_settled());
        assert!(!copy.envelope().settle());
    }

    #[test]
    fn clones_share_retry_count() {
        let mut msg = Message::new(json!({}));
        msg.set_envelope(Envelope::received(
            "q",
            DeliveryTag::new(1, 1),
            2,
            None,
            b"{}".to_vec(),
            BasicProperties::default(),
        ));
        let copy = msg.clone();

        assert_eq!(copy.envelope().increment_retries(), 3);
        assert_eq!(msg.envelope().retries(), 3);
    }
}
