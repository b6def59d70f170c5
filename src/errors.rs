// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Runtime
//!
//! This module provides the error type shared by every broker operation.
//! The `BrokerError` enum covers connection lifecycle, channel setup, exchange and
//! queue declaration, binding reconciliation, publishing and delivery settlement.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Every variant is surfaced to the immediate caller; nothing in this crate
/// retries on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker or the management API is unreachable, or rejected the credentials
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation needed a connection, channel or exchange that is not open
    #[error("not connected: {0}")]
    NotConnectedError(&'static str),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring the channel prefetch
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to the exchange with a routing key
    #[error("failure to bind queue `{0}` with routing key `{1}`")]
    BindingError(String, String),

    /// Error removing a routing key binding from a queue
    #[error("failure to unbind queue `{0}` from routing key `{1}`")]
    UnbindingError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// The broker did not confirm a publish on a confirm-mode channel
    #[error("publisher confirm failed: {0}")]
    ConfirmError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// The management API answered with an unexpected response
    #[error("management api error: {0}")]
    ApiError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging or rejecting a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error closing a channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
