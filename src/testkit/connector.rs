//! Mock [`Connector`] and [`StreamingClient`].
//!
//! Every stream opened through any client of a [`MockConnector`] is backed
//! by a [`channel_subscription`] whose handle is recorded on the connector,
//! in opening order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::stream::{channel_subscription, ChannelSubscriptionHandle};
use crate::error::StreamError;
use crate::port::stream::{Connector, StreamingClient, SubscriptionStream};

type Handles = Arc<Mutex<Vec<ChannelSubscriptionHandle>>>;

/// Connector that hands out [`MockClient`]s.
#[derive(Default)]
pub struct MockConnector {
    dial_count: AtomicU32,
    failures: Mutex<VecDeque<StreamError>>,
    dial_delay: Mutex<Duration>,
    streams: Handles,
    endpoints: Mutex<Vec<(String, String)>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next dial fail with `err`. Queued failures apply in order.
    pub fn fail_next(&self, err: StreamError) {
        self.failures.lock().push_back(err);
    }

    /// Delay every dial by `delay`.
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock() = delay;
    }

    /// How many times `connect()` was called.
    pub fn dial_count(&self) -> u32 {
        self.dial_count.load(Ordering::SeqCst)
    }

    /// `(endpoint, credential)` pairs seen by `connect()`.
    pub fn dialed(&self) -> Vec<(String, String)> {
        self.endpoints.lock().clone()
    }

    /// Handles of every stream opened so far.
    pub fn streams(&self) -> Vec<ChannelSubscriptionHandle> {
        self.streams.lock().clone()
    }

    /// Handle of the most recently opened stream.
    pub fn last_stream(&self) -> Option<ChannelSubscriptionHandle> {
        self.streams.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &str,
    ) -> Result<Arc<dyn StreamingClient>, StreamError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        self.endpoints
            .lock()
            .push((endpoint.to_string(), credential.to_string()));

        let delay = *self.dial_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Arc::new(MockClient {
            streams: self.streams.clone(),
        }))
    }
}

/// Client whose streams are [`channel_subscription`]s.
pub struct MockClient {
    streams: Handles,
}

#[async_trait]
impl StreamingClient for MockClient {
    async fn open_stream(&self) -> Result<Box<dyn SubscriptionStream>, StreamError> {
        let (stream, handle) = channel_subscription(64);
        self.streams.lock().push(handle);
        Ok(Box::new(stream))
    }
}
