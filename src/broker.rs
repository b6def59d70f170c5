// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! The broker owns the single connection to RabbitMQ, its default channel and
//! the exchange everything is published to and bound on. It also keeps the
//! channels handed out to worker tasks and the pool tracking those workers.
//!
//! Lifecycle transitions (`open`, `close`) take `&mut self`; everything else can
//! be shared. Operations on the default channel are serialized by a lock since an
//! AMQP channel must not be used concurrently.

use crate::{
    api::{group_bindings, HttpManagementApi, ManagementApi},
    bindings::BindingPlan,
    channel::{AmqpChannel, AmqpConnection, ChannelOptions, LapinTransport, Transport},
    config::BrokerConfig,
    errors::BrokerError,
    exchange::ExchangeDefinition,
    properties::{GlobalProperties, MessageProperties},
    publisher::{PublishTarget, Publisher},
    queue::{Queue, QueueDefinition},
    worker::{WorkerId, WorkerPool},
};
use futures_util::{future::BoxFuture, FutureExt};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, error, info};

/// Options for [`Broker::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Connect to the management API while opening
    pub enable_http_api_use: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            enable_http_api_use: true,
        }
    }
}

impl OpenOptions {
    /// Opens without touching the management API.
    pub fn without_http_api() -> Self {
        OpenOptions {
            enable_http_api_use: false,
        }
    }
}

struct Session {
    connection: Arc<dyn AmqpConnection>,
    exchange: ExchangeDefinition,
    target: PublishTarget,
    worker_channels: Mutex<HashMap<WorkerId, Arc<dyn AmqpChannel>>>,
}

impl Session {
    fn worker_channels(&self) -> MutexGuard<'_, HashMap<WorkerId, Arc<dyn AmqpChannel>>> {
        self.worker_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Broker {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    api: Arc<dyn ManagementApi>,
    global_properties: GlobalProperties,
    session: Option<Session>,
    workers: WorkerPool,
}

impl Broker {
    /// Creates a broker talking to RabbitMQ through lapin and the management API
    /// through HTTP.
    pub fn new(config: BrokerConfig) -> Broker {
        let api = Arc::new(HttpManagementApi::new(&config));
        Broker::with_collaborators(config, Arc::new(LapinTransport::new()), api)
    }

    /// Creates a broker on top of the given transport and management API.
    pub fn with_collaborators(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ManagementApi>,
    ) -> Broker {
        Broker {
            config,
            transport,
            api,
            global_properties: GlobalProperties::None,
            session: None,
            workers: WorkerPool::new(),
        }
    }

    /// Properties merged into every message published through this broker.
    pub fn with_global_properties(mut self, global: impl Into<GlobalProperties>) -> Self {
        self.global_properties = global.into();
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Connects, opens the default channel and declares the exchange. Also
    /// connects to the management API unless disabled by `options` or the
    /// configuration. Nothing is retried; on failure whatever was opened is
    /// closed again. Opening an open broker keeps the current session.
    pub async fn open(&mut self, options: OpenOptions) -> Result<(), BrokerError> {
        if self.session.is_some() {
            debug!("broker already connected");
            return Ok(());
        }

        let connection = self.transport.connect(&self.config).await?;

        match self.set_up(connection.clone(), options).await {
            Ok(session) => {
                info!(
                    host = %self.config.mq_host,
                    exchange = %session.exchange.name(),
                    "broker connected"
                );
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    error!(
                        error = close_err.to_string(),
                        "failure to close connection after failed open"
                    );
                }
                Err(err)
            }
        }
    }

    async fn set_up(
        &self,
        connection: Arc<dyn AmqpConnection>,
        options: OpenOptions,
    ) -> Result<Session, BrokerError> {
        let channel = connection
            .open_channel(ChannelOptions::from_config(&self.config))
            .await?;

        let exchange = ExchangeDefinition::from_config(&self.config);
        channel.declare_exchange(&exchange).await?;

        if options.enable_http_api_use && self.config.enable_http_api_use {
            self.api.connect().await?;
        } else {
            debug!("skipping management api connection");
        }

        Ok(Session {
            target: PublishTarget::new(channel, exchange.name()),
            connection,
            exchange,
            worker_channels: Mutex::new(HashMap::new()),
        })
    }

    /// Opens the broker, runs `body`, then closes the broker whatever the body's
    /// outcome, panics included.
    ///
    /// The body's error wins over a close error.
    pub async fn open_with_scope<F, T>(
        &mut self,
        options: OpenOptions,
        body: F,
    ) -> Result<T, BrokerError>
    where
        F: for<'b> FnOnce(&'b Broker) -> BoxFuture<'b, Result<T, BrokerError>>,
    {
        self.open(options).await?;

        let outcome = AssertUnwindSafe(body(&*self)).catch_unwind().await;
        let closed = self.close().await;

        match outcome {
            Ok(result) => {
                let value = result?;
                closed?;
                Ok(value)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Closes worker channels, the default channel and the connection. Does
    /// nothing when not connected. Every close is attempted; the first failure is
    /// returned.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        debug!("closing broker connection...");

        let worker_channels: Vec<_> = session.worker_channels().drain().collect();
        let mut first_err = None;

        for (worker, channel) in worker_channels {
            if let Err(err) = channel.close().await {
                error!(worker = %worker, error = err.to_string(), "failure to close worker channel");
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = session.target.channel.close().await {
            first_err.get_or_insert(err);
        }

        if let Err(err) = session.connection.close().await {
            first_err.get_or_insert(err);
        }

        debug!("broker connection closed");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn session(&self) -> Result<&Session, BrokerError> {
        self.session
            .as_ref()
            .ok_or(BrokerError::NotConnectedError("broker is not open"))
    }

    pub fn connection(&self) -> Result<&Arc<dyn AmqpConnection>, BrokerError> {
        self.session().map(|s| &s.connection)
    }

    /// The default channel.
    ///
    /// The broker serializes its own use of this channel behind an internal
    /// lock; calls made directly on the returned handle bypass that lock and must
    /// not overlap with publishing or binding through the broker.
    pub fn channel(&self) -> Result<&Arc<dyn AmqpChannel>, BrokerError> {
        self.session().map(|s| &s.target.channel)
    }

    pub fn exchange(&self) -> Result<&ExchangeDefinition, BrokerError> {
        self.session().map(|s| &s.exchange)
    }

    /// Declares a durable queue named `name`, prefixed with the namespace.
    pub async fn queue(&self, name: &str) -> Result<Queue, BrokerError> {
        self.declare_queue(&QueueDefinition::new(name)).await
    }

    /// Declares the queue described by `def`, prefixing its name with the namespace.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<Queue, BrokerError> {
        let session = self.session()?;
        let def = def.renamed(self.config.namespaced(def.name()));

        let _guard = session.target.lock.lock().await;
        session.target.channel.declare_queue(&def).await?;
        debug!(queue = def.name(), "queue declared");

        Ok(Queue::new(def.name()))
    }

    /// Routing keys currently bound on the exchange, per queue, as the management
    /// API reports them.
    pub async fn current_bindings(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, BrokerError> {
        let records = self.api.bindings(None).await?;
        Ok(group_bindings(
            &records,
            &self.config.mq_exchange,
            &self.config.mq_vhost,
        ))
    }

    /// Makes `routing_keys` the exact set of keys `queue` is bound with: binds
    /// every one of them, then unbinds any other key currently bound.
    pub async fn bind_queue<S>(&self, queue: &Queue, routing_keys: &[S]) -> Result<(), BrokerError>
    where
        S: AsRef<str>,
    {
        let session = self.session()?;
        let existing = self
            .current_bindings()
            .await?
            .remove(queue.name())
            .unwrap_or_default();

        let plan = BindingPlan::new(routing_keys, &existing);
        debug!(
            queue = queue.name(),
            binds = plan.binds.len(),
            unbinds = plan.unbinds.len(),
            "reconciling queue bindings"
        );

        let _guard = session.target.lock.lock().await;
        plan.apply(
            session.target.channel.as_ref(),
            queue.name(),
            session.exchange.name(),
        )
        .await
    }

    /// A publisher on the default channel, or one that refuses to publish when
    /// the broker is not open.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.session.as_ref().map(|s| s.target.clone()),
            self.global_properties.clone(),
        )
    }

    /// Publishes `message` as JSON on the broker's exchange.
    ///
    /// # Parameters
    /// - `routing_key`: key the message is routed with
    /// - `message`: any serializable value
    ///
    /// # Returns
    /// `Ok(())` once the message is handed to the broker, or confirmed when the
    /// default channel is in confirm mode. Fails with
    /// [`BrokerError::PublishError`] when the broker is not open and with
    /// [`BrokerError::ConfirmError`] when the broker refuses the message.
    pub async fn publish<T>(&self, routing_key: &str, message: &T) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher().publish(routing_key, message).await
    }

    /// Same as [`Broker::publish`], with `properties` overriding the default and
    /// global properties. A `routing_key` property replaces `routing_key`.
    pub async fn publish_with<T>(
        &self,
        routing_key: &str,
        message: &T,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher()
            .publish_with(routing_key, message, properties)
            .await
    }

    pub fn using_publisher_confirmations(&self) -> bool {
        self.channel()
            .map(|channel| channel.options().confirms)
            .unwrap_or(false)
    }

    pub async fn wait_for_confirms(&self) -> Result<(), BrokerError> {
        let session = self.session()?;
        let _guard = session.target.lock.lock().await;
        session.target.channel.wait_for_confirms().await
    }

    /// Channel registered for `worker` by [`Broker::open_worker_channel`].
    fn worker_channel(&self, worker: WorkerId) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        self.session()?
            .worker_channels()
            .get(&worker)
            .cloned()
            .ok_or_else(|| {
                error!(worker = %worker, "no channel open for worker");
                BrokerError::ChannelError(format!("no channel open for {}", worker))
            })
    }

    /// Acknowledges a delivery received on the channel of `worker`. Delivery
    /// tags are scoped to the channel that delivered them.
    pub async fn ack(&self, worker: WorkerId, delivery_tag: u64) -> Result<(), BrokerError> {
        self.worker_channel(worker)?.ack(delivery_tag).await
    }

    /// Negatively acknowledges a delivery of `worker` without requeuing it.
    pub async fn nack(&self, worker: WorkerId, delivery_tag: u64) -> Result<(), BrokerError> {
        self.worker_channel(worker)?.nack(delivery_tag, false).await
    }

    pub async fn reject(
        &self,
        worker: WorkerId,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.worker_channel(worker)?
            .reject(delivery_tag, requeue)
            .await
    }

    /// Puts a delivery of `worker` back on its queue.
    pub async fn requeue(&self, worker: WorkerId, delivery_tag: u64) -> Result<(), BrokerError> {
        self.reject(worker, delivery_tag, true).await
    }

    /// Opens a dedicated channel for `worker`, with the same prefetch and confirm
    /// settings as the default channel. Returns the existing one if already open.
    pub async fn open_worker_channel(
        &self,
        worker: WorkerId,
    ) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        let session = self.session()?;

        if let Some(channel) = session.worker_channels().get(&worker) {
            return Ok(channel.clone());
        }

        let channel = session
            .connection
            .open_channel(ChannelOptions::from_config(&self.config))
            .await?;
        debug!(worker = %worker, "worker channel opened");

        Ok(session
            .worker_channels()
            .entry(worker)
            .or_insert(channel)
            .clone())
    }

    /// Closes and forgets the channel of `worker`, if any.
    pub async fn release_worker_channel(&self, worker: WorkerId) -> Result<(), BrokerError> {
        let Ok(session) = self.session() else {
            return Ok(());
        };

        let channel = session.worker_channels().remove(&worker);
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// See [`WorkerPool::wait_on_threads`].
    pub async fn wait_on_threads(&self, timeout: Duration) -> bool {
        self.workers.wait_on_threads(timeout).await
    }
}
