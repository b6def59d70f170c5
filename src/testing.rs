// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Shared helpers for the unit tests.

use crate::{
    channel::{ChannelOptions, MockAmqpChannel},
    properties::MessageProperties,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tracing::{subscriber::DefaultGuard, Event, Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer, Registry,
};

/// (exchange, routing key, payload, properties) of a publish seen by a mock channel
pub(crate) type Published = Arc<Mutex<Vec<(String, String, Vec<u8>, MessageProperties)>>>;

/// Counts error level events emitted while its guard is alive.
#[derive(Clone, Default)]
pub(crate) struct ErrorCount(Arc<AtomicUsize>);

impl ErrorCount {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for ErrorCount {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Installs an error counting subscriber for the current thread.
pub(crate) fn capture_errors() -> (ErrorCount, DefaultGuard) {
    let errors = ErrorCount::default();
    let subscriber = Registry::default().with(errors.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (errors, guard)
}

/// A mock channel accepting any number of publishes and recording them.
pub(crate) fn recording_channel(options: ChannelOptions) -> (MockAmqpChannel, Published) {
    let published: Published = Arc::default();
    let sink = published.clone();

    let mut channel = MockAmqpChannel::new();
    channel.expect_options().return_const(options);
    channel
        .expect_publish()
        .returning(move |exchange, key, payload, props| {
            sink.lock().unwrap().push((
                exchange.to_owned(),
                key.to_owned(),
                payload.to_vec(),
                props.clone(),
            ));
            Ok(())
        });
    channel.expect_wait_for_confirms().returning(|| Ok(()));

    (channel, published)
}
