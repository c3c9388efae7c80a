// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the AMQP headers of every message the engine
//! publishes. Workers extract it from the incoming delivery and run the
//! pipeline inside a consumer span that continues the producer's trace.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

const TRACER_NAME: &str = "flowline worker";

/// Injector/extractor over an AMQP header table.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| error!(error = err.to_string(), key, "invalid trace header"))
                .ok(),
            Some(AMQPValue::ShortString(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes `ctx` into `headers` with the globally installed propagator.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Reads the producer context out of the delivery headers.
pub(crate) fn extract_context(props: &BasicProperties) -> Context {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    })
}

/// Starts the consumer span of one pipeline run and returns the context that
/// carries it; outgoing messages are published under that context.
pub(crate) fn process_context(props: &BasicProperties, pipeline: &str) -> Context {
    let parent = extract_context(props);
    let tracer = global::tracer(TRACER_NAME);

    let span = tracer
        .span_builder(Cow::from(pipeline.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    parent.with_span(span)
}
