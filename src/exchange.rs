// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definition
//!
//! The broker routes everything through a single exchange, a durable topic
//! exchange unless configured otherwise. This module describes that exchange
//! and maps its kind onto lapin's.

use crate::config::BrokerConfig;
use serde::Deserialize;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of the exchange used for all publishing and binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a durable topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    /// Creates the exchange definition described by the configuration.
    pub fn from_config(cfg: &BrokerConfig) -> ExchangeDefinition {
        ExchangeDefinition::new(&cfg.mq_exchange).kind(cfg.mq_exchange_type)
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_configured_name_and_kind() {
        let cfg = BrokerConfig {
            mq_exchange: "orders".to_owned(),
            mq_exchange_type: ExchangeKind::Fanout,
            ..Default::default()
        };

        let def = ExchangeDefinition::from_config(&cfg);
        assert_eq!(def.name(), "orders");
        assert_eq!(def.exchange_kind(), ExchangeKind::Fanout);
        assert!(def.is_durable());
    }
}
