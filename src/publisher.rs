// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes values to JSON and publishes them on the broker's exchange.
//! Properties are layered: publisher defaults, then global properties, then the
//! properties given for the call. The caller's trace context is injected into the
//! headers. On a confirm-mode channel each publish waits for the broker's confirm.

use crate::{
    channel::AmqpChannel,
    errors::BrokerError,
    otel,
    properties::{GlobalProperties, MessageProperties},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where messages go: a channel, the exchange on it, and the lock that
/// serializes publishers sharing that channel.
#[derive(Clone)]
pub struct PublishTarget {
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) exchange: String,
    pub(crate) lock: Arc<Mutex<()>>,
}

impl PublishTarget {
    pub fn new(channel: Arc<dyn AmqpChannel>, exchange: &str) -> PublishTarget {
        PublishTarget {
            channel,
            exchange: exchange.to_owned(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Publishes JSON messages on a [`PublishTarget`].
///
/// A publisher built without a target fails every publish with
/// [`BrokerError::PublishError`], logging the failure first.
pub struct Publisher {
    target: Option<PublishTarget>,
    global: GlobalProperties,
}

impl Publisher {
    pub fn new(target: Option<PublishTarget>, global: GlobalProperties) -> Publisher {
        Publisher { target, global }
    }

    /// Publishes `message` with the default and global properties only.
    pub async fn publish<T>(&self, routing_key: &str, message: &T) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with(routing_key, message, &MessageProperties::default())
            .await
    }

    /// Publishes `message`, with `properties` taking precedence over everything else.
    pub async fn publish_with<T>(
        &self,
        routing_key: &str,
        message: &T,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let Some(target) = &self.target else {
            error!(
                routing_key,
                "unable to publish - no connection to broker"
            );
            return Err(BrokerError::PublishError(format!(
                "no connection to broker, routing key: {}",
                routing_key
            )));
        };

        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), routing_key, "failure to serialize message");
            BrokerError::SerializationError(err.to_string())
        })?;

        let props = self.properties(routing_key, properties);
        let key = props.routing_key.as_deref().unwrap_or(routing_key);

        let _guard = target.lock.lock().await;

        debug!(
            exchange = %target.exchange,
            routing_key = key,
            "publishing message"
        );
        target
            .channel
            .publish(&target.exchange, key, &payload, &props)
            .await?;

        if target.channel.options().confirms {
            target.channel.wait_for_confirms().await?;
        }

        Ok(())
    }

    /// Final properties for a publish on `routing_key`.
    fn properties(&self, routing_key: &str, explicit: &MessageProperties) -> MessageProperties {
        let mut props = MessageProperties::new()
            .persistent(true)
            .routing_key(routing_key)
            .content_type(JSON_CONTENT_TYPE)
            .message_id(&Uuid::new_v4().to_string())
            .timestamp(chrono::Utc::now().timestamp().max(0) as u64)
            .merged(&self.global.resolve())
            .merged(explicit);

        otel::inject_current_context(&mut props.headers);
        props
    }
}
