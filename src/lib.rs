// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod api;
pub mod bindings;
pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod properties;
pub mod publisher;
pub mod queue;
pub mod worker;

pub use broker::{Broker, OpenOptions};
pub use config::BrokerConfig;
pub use errors::BrokerError;
