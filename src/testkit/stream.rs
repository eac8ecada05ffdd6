//! Mock [`SubscriptionStream`] driven from the test through a control handle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::port::stream::{StreamMessage, SubscribeRequest, SubscriptionStream};

type Item = Option<Result<StreamMessage, StreamError>>;

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<SubscribeRequest>>,
    cancel_count: AtomicU32,
    cancel_error: Mutex<Option<StreamError>>,
    cancel_hangs: AtomicBool,
    dropped: AtomicBool,
}

/// A mock stream controlled externally via a [`ChannelSubscriptionHandle`].
///
/// Items are sent through the handle and read by whoever owns the stream.
/// No real network I/O.
pub struct ChannelSubscription {
    rx: mpsc::Receiver<Item>,
    shared: Arc<Shared>,
}

/// Control handle for a [`ChannelSubscription`].
#[derive(Clone)]
pub struct ChannelSubscriptionHandle {
    tx: mpsc::Sender<Item>,
    shared: Arc<Shared>,
}

impl ChannelSubscriptionHandle {
    /// Deliver a message with the given payload.
    pub async fn send(&self, payload: &str) {
        let _ = self
            .tx
            .send(Some(Ok(StreamMessage::new(payload.as_bytes()))))
            .await;
    }

    /// Make the stream fail with `err`.
    pub async fn fail(&self, err: StreamError) {
        let _ = self.tx.send(Some(Err(err))).await;
    }

    /// Signal end-of-stream (causes `next_message` to return `None`).
    pub async fn close(&self) {
        let _ = self.tx.send(None).await;
    }

    /// Make every subsequent `cancel()` return `err`.
    pub fn fail_cancel_with(&self, err: StreamError) {
        *self.shared.cancel_error.lock() = Some(err);
    }

    /// Make every subsequent `cancel()` never complete.
    pub fn hang_on_cancel(&self) {
        self.shared.cancel_hangs.store(true, Ordering::SeqCst);
    }

    /// How many times `cancel()` was called.
    pub fn cancel_count(&self) -> u32 {
        self.shared.cancel_count.load(Ordering::SeqCst)
    }

    /// True once `cancel()` was called at least once.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_count() > 0
    }

    /// True once the stream object itself has been dropped.
    pub fn is_dropped(&self) -> bool {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Subscription requests written so far.
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.shared.requests.lock().clone()
    }
}

/// Create a [`ChannelSubscription`] and its control handle.
pub fn channel_subscription(buffer: usize) -> (ChannelSubscription, ChannelSubscriptionHandle) {
    let (tx, rx) = mpsc::channel(buffer);
    let shared = Arc::new(Shared::default());
    (
        ChannelSubscription {
            rx,
            shared: shared.clone(),
        },
        ChannelSubscriptionHandle { tx, shared },
    )
}

#[async_trait]
impl SubscriptionStream for ChannelSubscription {
    async fn send(&mut self, request: SubscribeRequest) -> Result<(), StreamError> {
        self.shared.requests.lock().push(request);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>> {
        self.rx.recv().await.flatten()
    }

    async fn cancel(&mut self) -> Result<(), StreamError> {
        self.shared.cancel_count.fetch_add(1, Ordering::SeqCst);
        if self.shared.cancel_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        match self.shared.cancel_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.shared.dropped.store(true, Ordering::SeqCst);
    }
}
