// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Reconciliation
//!
//! Moves the routing keys a queue is bound with from what the broker currently
//! reports to what the caller wants. Every desired key is (re)bound, then every
//! key the broker reports that is no longer desired is unbound. Binding first
//! keeps the queue bound throughout when the two sets overlap.
//!
//! Re-binding an already bound key is a no-op on the broker, and is kept.
//! A failure stops the reconciliation where it is; operations already applied
//! stay applied.

use crate::{channel::AmqpChannel, errors::BrokerError};
use std::collections::BTreeSet;
use tracing::debug;

/// The bind and unbind operations needed to reach a desired set of routing keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingPlan {
    /// Every desired key, in the caller's order, without duplicates
    pub binds: Vec<String>,
    /// Keys currently bound that are not desired
    pub unbinds: Vec<String>,
}

impl BindingPlan {
    pub fn new<S>(desired: &[S], existing: &BTreeSet<String>) -> BindingPlan
    where
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let binds: Vec<String> = desired
            .iter()
            .map(|key| key.as_ref().to_owned())
            .filter(|key| seen.insert(key.clone()))
            .collect();

        let unbinds = existing
            .iter()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();

        BindingPlan { binds, unbinds }
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.unbinds.is_empty()
    }

    /// Applies the plan on `channel`: all binds, then all unbinds.
    pub async fn apply(
        &self,
        channel: &dyn AmqpChannel,
        queue: &str,
        exchange: &str,
    ) -> Result<(), BrokerError> {
        for key in &self.binds {
            debug!(queue, exchange, routing_key = %key, "binding queue");
            channel.bind_queue(queue, exchange, key).await?;
        }

        for key in &self.unbinds {
            debug!(queue, exchange, routing_key = %key, "removing redundant binding");
            channel.unbind_queue(queue, exchange, key).await?;
        }

        Ok(())
    }
}
