// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the AMQP headers. The publisher injects the
//! current context, dispatch extracts it and runs each handler invocation in
//! a consumer span.

use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Reads and writes trace context entries in a header table.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| warn!(key, error = e.to_string(), "undecodable trace header"))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the given context into a fresh header table.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });
    headers
}

/// Extracts the upstream context from `headers` and starts a consumer span.
pub(crate) fn new_span(
    headers: &BTreeMap<ShortString, AMQPValue>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_reads_long_strings_only() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString("00-abc-def-01".into()),
        );
        headers.insert(ShortString::from("count"), AMQPValue::LongInt(3));

        let propagator = HeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn test_injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeaderPropagator::new(&mut headers).set("TraceParent", "v".to_owned());
        assert!(headers.contains_key(&ShortString::from("traceparent")));
    }
}
