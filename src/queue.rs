// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definition
//!
//! Queues have a lifecycle of their own; the broker only declares them (durable by
//! default) and manages their bindings. The definition carries the optional
//! `x-` arguments RabbitMQ understands at declaration time.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Definition of a queue with its declaration parameters.
///
/// The name given here is the bare name; the broker applies the configured
/// namespace when declaring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            dead_letter_exchange: None,
        }
    }

    /// Makes the queue transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected and expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a copy of this definition carrying another name.
    pub(crate) fn renamed(&self, name: String) -> QueueDefinition {
        QueueDefinition {
            name,
            ..self.clone()
        }
    }

    /// Declaration arguments in the form lapin expects.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }

        FieldTable::from(args)
    }
}

/// Handle to a declared queue, as returned by [`Broker::queue`](crate::broker::Broker::queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    name: String,
}

impl Queue {
    pub fn new(name: &str) -> Queue {
        Queue {
            name: name.to_owned(),
        }
    }

    /// The full, namespaced queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
