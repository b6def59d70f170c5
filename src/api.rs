// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Management API Client
//!
//! Read-only access to the RabbitMQ management HTTP API. The broker only needs
//! it to list the bindings that currently exist, which is the starting point of
//! binding reconciliation. What it returns is a snapshot: bindings changed
//! concurrently by someone else may not be reflected.

use crate::{
    config::{encode, BrokerConfig},
    errors::BrokerError,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// Destination type the management API reports for queue bindings
pub const QUEUE_DESTINATION_TYPE: &str = "queue";

/// A binding as reported by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingRecord {
    pub source: String,
    pub vhost: String,
    pub destination: String,
    pub destination_type: String,
    pub routing_key: String,
}

/// Client of the broker's administrative HTTP API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Establishes the client and checks the API answers. Calling it again once
    /// connected is a no-op.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Lists bindings in the configured vhost, or only those of `queue`.
    /// Connects first if needed.
    async fn bindings(&self, queue: Option<String>) -> Result<Vec<BindingRecord>, BrokerError>;
}

/// Groups binding records into queue name -> routing keys, keeping only queue
/// bindings from `exchange` in `vhost`.
pub fn group_bindings(
    records: &[BindingRecord],
    exchange: &str,
    vhost: &str,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut grouped = BTreeMap::<String, BTreeSet<String>>::new();

    for record in records {
        // default exchange bindings use the queue name as routing key
        if record.destination == record.routing_key {
            continue;
        }
        if record.source != exchange
            || record.vhost != vhost
            || record.destination_type != QUEUE_DESTINATION_TYPE
        {
            continue;
        }

        grouped
            .entry(record.destination.clone())
            .or_default()
            .insert(record.routing_key.clone());
    }

    grouped
}

/// reqwest backed [`ManagementApi`].
pub struct HttpManagementApi {
    base_url: String,
    vhost: String,
    username: String,
    password: String,
    timeout: std::time::Duration,
    client: OnceCell<Client>,
}

impl HttpManagementApi {
    /// Creates a client for the management API described by `cfg`.
    ///
    /// # Parameters
    /// - `cfg`: broker configuration; host, port and scheme of the API, the vhost
    ///   to inspect, the credentials and the request timeout are read from it
    ///
    /// # Returns
    /// A client that does not touch the network until first used.
    pub fn new(cfg: &BrokerConfig) -> Self {
        HttpManagementApi {
            base_url: cfg.api_base_url(),
            vhost: cfg.mq_vhost.clone(),
            username: cfg.mq_username.clone(),
            password: cfg.mq_password.clone(),
            timeout: cfg.connection_timeout(),
            client: OnceCell::new(),
        }
    }

    fn overview_url(&self) -> String {
        format!("{}/api/overview", self.base_url)
    }

    fn bindings_url(&self, queue: Option<&str>) -> String {
        match queue {
            Some(queue) => format!(
                "{}/api/queues/{}/{}/bindings",
                self.base_url,
                encode(&self.vhost),
                encode(queue)
            ),
            None => format!("{}/api/bindings/{}", self.base_url, encode(&self.vhost)),
        }
    }

    async fn client(&self) -> Result<&Client, BrokerError> {
        self.client
            .get_or_try_init(|| async {
                debug!(url = %self.base_url, "connecting to the management api...");
                let client = Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to build http client");
                        BrokerError::ConnectionError(err.to_string())
                    })?;

                self.get(&client, &self.overview_url()).await?;
                debug!("management api connected");
                Ok::<Client, BrokerError>(client)
            })
            .await
    }

    async fn get(&self, client: &Client, url: &str) -> Result<reqwest::Response, BrokerError> {
        let response = client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), url, "management api unreachable");
                BrokerError::ConnectionError(err.to_string())
            })?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!(url, "management api rejected the credentials");
                Err(BrokerError::ConnectionError(format!(
                    "credentials rejected by {}",
                    url
                )))
            }
            status => {
                error!(url, status = status.as_u16(), "unexpected management api status");
                Err(BrokerError::ApiError(format!("{} answered {}", url, status)))
            }
        }
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.client().await.map(|_| ())
    }

    async fn bindings(&self, queue: Option<String>) -> Result<Vec<BindingRecord>, BrokerError> {
        let client = self.client().await?;
        let url = self.bindings_url(queue.as_deref());

        self.get(client, &url)
            .await?
            .json::<Vec<BindingRecord>>()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to decode bindings");
                BrokerError::ApiError(err.to_string())
            })
    }
}
