// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Published messages carry the caller's trace context in their headers so a
//! consumer on the other side can continue the trace.

use crate::properties::HeaderValue;
use opentelemetry::{global, propagation::Injector, Context};
use std::collections::BTreeMap;

/// Writes trace context entries into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, HeaderValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, HeaderValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

/// Injects the current trace context into `headers` using the global propagator.
pub(crate) fn inject_current_context(headers: &mut BTreeMap<String, HeaderValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(headers))
    });
}
