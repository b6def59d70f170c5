// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the seam between the broker and the AMQP client library.
//! `Transport` opens connections, `AmqpConnection` opens channels and
//! `AmqpChannel` carries every per-channel operation the broker needs. The
//! production implementation is backed by lapin; tests substitute mocks.

use crate::{
    config::BrokerConfig, errors::BrokerError, exchange::ExchangeDefinition,
    properties::MessageProperties, queue::QueueDefinition,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Settings fixed on a channel when it is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// QoS prefetch count, applied before any consumption starts
    pub prefetch: Option<u16>,
    /// Put the channel in publisher confirm mode
    pub confirms: bool,
}

impl ChannelOptions {
    pub fn from_config(cfg: &BrokerConfig) -> ChannelOptions {
        ChannelOptions {
            prefetch: cfg.channel_prefetch,
            confirms: cfg.force_publisher_confirms,
        }
    }
}

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, cfg: &BrokerConfig) -> Result<Arc<dyn AmqpConnection>, BrokerError>;
}

/// One logical session with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Arc<dyn AmqpChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// A channel on an [`AmqpConnection`]. Not safe for concurrent use: callers
/// sharing a channel must serialize access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn options(&self) -> ChannelOptions;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Blocks until the broker has settled every outstanding publish. A publish
    /// the broker negatively acknowledged fails with [`BrokerError::ConfirmError`].
    async fn wait_for_confirms(&self) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// lapin backed [`Transport`].
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, cfg: &BrokerConfig) -> Result<Arc<dyn AmqpConnection>, BrokerError> {
        debug!(
            host = %cfg.mq_host,
            port = cfg.mq_port,
            tls = cfg.mq_tls,
            "creating amqp connection..."
        );

        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(&cfg.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(BrokerError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// lapin backed [`AmqpConnection`].
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(BrokerError::ChannelError(err.to_string()))
            }
        }?;

        if let Some(prefetch) = options.prefetch {
            debug!(prefetch, "setting channel prefetch");
            if let Err(err) = channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "error to configure channel qos");
                return Err(BrokerError::QoSDeclarationError(err.to_string()));
            }
        }

        if options.confirms {
            debug!("enabling publisher confirms");
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(BrokerError::ChannelError(err.to_string()));
            }
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel {
            channel,
            options,
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn
            .close(AMQP_REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                BrokerError::CloseError(err.to_string())
            })
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }
}

/// lapin backed [`AmqpChannel`].
pub struct LapinChannel {
    channel: Channel,
    options: ChannelOptions,
    /// confirms of publishes not yet waited for, confirm mode only
    pending: Mutex<Vec<PublisherConfirm>>,
}

/// Maps the broker's answer to a confirm-mode publish.
pub(crate) fn confirmation_outcome(
    confirmation: Result<Confirmation, lapin::Error>,
) -> Result<(), BrokerError> {
    match confirmation {
        Ok(Confirmation::Nack(_)) => {
            error!("broker nacked a published message");
            Err(BrokerError::ConfirmError(
                "message nacked by the broker".to_owned(),
            ))
        }
        Ok(_) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), "error waiting for confirms");
            Err(BrokerError::ConfirmError(err.to_string()))
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn options(&self) -> ChannelOptions {
        self.options
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(BrokerError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(BrokerError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                BrokerError::BindingError(queue.to_owned(), routing_key.to_owned())
            })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                BrokerError::UnbindingError(queue.to_owned(), routing_key.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties.to_basic_properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BrokerError::PublishError(err.to_string()))
            }
            Ok(confirm) => {
                if self.options.confirms {
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(confirm);
                }
                Ok(())
            }
        }
    }

    async fn wait_for_confirms(&self) -> Result<(), BrokerError> {
        let pending =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        let mut outcome = Ok(());
        for confirm in pending {
            let settled = confirmation_outcome(confirm.await);
            if outcome.is_ok() {
                outcome = settled;
            }
        }
        outcome
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                BrokerError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                BrokerError::NackMessageError(delivery_tag)
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                BrokerError::NackMessageError(delivery_tag)
            })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(AMQP_REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                BrokerError::CloseError(err.to_string())
            })
    }
}
