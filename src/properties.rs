// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! Properties travel with every published message. They are assembled in layers:
//! publisher defaults, then the process-wide global properties, then whatever the
//! caller passes explicitly. A later layer wins field by field, and headers are
//! merged key by key.

use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode for messages kept in memory only
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
        }
    }
}

/// Properties attached to a published message.
///
/// Unset fields (`None`, or absent header keys) leave the lower layer untouched
/// when merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub persistent: Option<bool>,
    /// Routing key the message is published with
    pub routing_key: Option<String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the unix epoch
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
    /// Message type, the AMQP `type` property
    pub kind: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as AMQP expects it
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub user_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn user_id(mut self, user: &str) -> Self {
        self.user_id = Some(user.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Overlays `other` on top of `self`: every field set in `other` wins.
    pub fn merge(&mut self, other: &MessageProperties) {
        fn overlay<T: Clone>(base: &mut Option<T>, top: &Option<T>) {
            if let Some(value) = top {
                *base = Some(value.clone());
            }
        }

        overlay(&mut self.persistent, &other.persistent);
        overlay(&mut self.routing_key, &other.routing_key);
        overlay(&mut self.content_type, &other.content_type);
        overlay(&mut self.message_id, &other.message_id);
        overlay(&mut self.timestamp, &other.timestamp);
        overlay(&mut self.app_id, &other.app_id);
        overlay(&mut self.kind, &other.kind);
        overlay(&mut self.correlation_id, &other.correlation_id);
        overlay(&mut self.reply_to, &other.reply_to);
        overlay(&mut self.expiration, &other.expiration);
        overlay(&mut self.priority, &other.priority);
        overlay(&mut self.user_id, &other.user_id);

        for (key, value) in &other.headers {
            self.headers.insert(key.clone(), value.clone());
        }
    }

    /// Returns `self` with `other` merged on top.
    pub fn merged(mut self, other: &MessageProperties) -> Self {
        self.merge(other);
        self
    }

    /// Converts to the lapin property set. `routing_key` is not an AMQP property
    /// and is left out.
    pub fn to_basic_properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default();

        if let Some(persistent) = self.persistent {
            props = props.with_delivery_mode(if persistent {
                PERSISTENT_DELIVERY_MODE
            } else {
                TRANSIENT_DELIVERY_MODE
            });
        }
        if let Some(v) = &self.content_type {
            props = props.with_content_type(ShortString::from(v.clone()));
        }
        if let Some(v) = &self.message_id {
            props = props.with_message_id(ShortString::from(v.clone()));
        }
        if let Some(v) = self.timestamp {
            props = props.with_timestamp(v);
        }
        if let Some(v) = &self.app_id {
            props = props.with_app_id(ShortString::from(v.clone()));
        }
        if let Some(v) = &self.kind {
            props = props.with_type(ShortString::from(v.clone()));
        }
        if let Some(v) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(v.clone()));
        }
        if let Some(v) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(v.clone()));
        }
        if let Some(v) = &self.expiration {
            props = props.with_expiration(ShortString::from(v.clone()));
        }
        if let Some(v) = self.priority {
            props = props.with_priority(v);
        }
        if let Some(v) = &self.user_id {
            props = props.with_user_id(ShortString::from(v.clone()));
        }

        if !self.headers.is_empty() {
            let mut table = BTreeMap::<ShortString, AMQPValue>::new();
            for (key, value) in &self.headers {
                table.insert(ShortString::from(key.clone()), AMQPValue::from(value));
            }
            props = props.with_headers(FieldTable::from(table));
        }

        props
    }
}

/// Process-wide properties merged into every publish.
///
/// Either a fixed set, or a provider evaluated afresh on each publish.
#[derive(Clone, Default)]
pub enum GlobalProperties {
    #[default]
    None,
    Static(MessageProperties),
    Provider(Arc<dyn Fn() -> MessageProperties + Send + Sync>),
}

impl GlobalProperties {
    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> MessageProperties + Send + Sync + 'static,
    {
        GlobalProperties::Provider(Arc::new(f))
    }

    /// Current value of the global properties.
    pub fn resolve(&self) -> MessageProperties {
        match self {
            GlobalProperties::None => MessageProperties::default(),
            GlobalProperties::Static(props) => props.clone(),
            GlobalProperties::Provider(f) => f(),
        }
    }
}

impl fmt::Debug for GlobalProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalProperties::None => write!(f, "GlobalProperties::None"),
            GlobalProperties::Static(props) => {
                f.debug_tuple("GlobalProperties::Static").field(props).finish()
            }
            GlobalProperties::Provider(_) => write!(f, "GlobalProperties::Provider(..)"),
        }
    }
}

impl From<MessageProperties> for GlobalProperties {
    fn from(props: MessageProperties) -> Self {
        GlobalProperties::Static(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn later_layers_win_field_by_field() {
        let base = MessageProperties::new()
            .persistent(true)
            .content_type("application/json")
            .header("tenant", "a")
            .header("trace", true);
        let top = MessageProperties::new()
            .persistent(false)
            .app_id("billing")
            .header("tenant", "b");

        let merged = base.merged(&top);

        assert_eq!(merged.persistent, Some(false));
        assert_eq!(merged.content_type.as_deref(), Some("application/json"));
        assert_eq!(merged.app_id.as_deref(), Some("billing"));
        assert_eq!(merged.headers.get("tenant"), Some(&HeaderValue::from("b")));
        assert_eq!(merged.headers.get("trace"), Some(&HeaderValue::Bool(true)));
    }

    #[test]
    fn provider_is_evaluated_on_every_resolve() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let global = GlobalProperties::provider(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            MessageProperties::new().correlation_id(&n.to_string())
        });

        assert_eq!(global.resolve().correlation_id.as_deref(), Some("0"));
        assert_eq!(global.resolve().correlation_id.as_deref(), Some("1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn maps_onto_amqp_properties() {
        let props = MessageProperties::new()
            .persistent(true)
            .routing_key("orders.created")
            .content_type("application/json")
            .priority(5)
            .header("attempt", 3i64)
            .to_basic_properties();

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(props.priority(), &Some(5));
        assert_eq!(
            props.content_type().as_ref().map(|v| v.as_str()),
            Some("application/json")
        );
        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("attempt"),
            Some(&AMQPValue::LongLongInt(3))
        );
    }
}
