//! Stream bindings: the link between a pooled connection and the one
//! upstream stream its owner is currently reading.
//!
//! Binding a stream hands it to a pump task that forwards messages to the
//! consumer through a bounded channel. The pump reports back to the pool
//! under the state lock:
//!
//! - an upstream error marks the entry unhealthy and clears the binding
//! - a natural end clears the binding, health untouched
//! - a pool-initiated cancellation is reported to nobody; errors raised by
//!   the upstream `cancel` call are logged and dropped
//!
//! Hooks carry the binding id, so a report from a stream that has already
//! been detached (released, reassigned, expired) is ignored.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::PoolInner;
use crate::domain::id::OwnerId;
use crate::error::StreamError;
use crate::port::stream::{StreamMessage, SubscriptionStream};

type Delivery = Result<StreamMessage, StreamError>;

/// Pool-side half of a bound stream, stored on the connection entry.
pub(super) struct StreamBinding {
    pub(super) id: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StreamBinding {
    /// Start pumping `stream` for the entry `connection_id`.
    pub(super) fn spawn(
        id: u64,
        connection_id: u64,
        owner: OwnerId,
        stream: Box<dyn SubscriptionStream>,
        buffer: usize,
        pool: Weak<PoolInner>,
    ) -> (Self, BoundStream) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(buffer);

        let pump = Pump {
            binding_id: id,
            connection_id,
            owner: owner.clone(),
            pool,
        };
        let task = tokio::spawn(pump.run(stream, cancel_rx, tx));

        let binding = Self {
            id,
            cancel_tx: Some(cancel_tx),
            task,
        };
        let bound = BoundStream {
            binding_id: id,
            connection_id,
            owner,
            rx,
        };
        (binding, bound)
    }

    /// Request cancellation and wait up to `grace` for the pump to finish.
    ///
    /// Idempotent with respect to streams that already ended. A pump that
    /// does not acknowledge in time is aborted, which drops the upstream
    /// stream.
    pub(super) async fn cancel(mut self, grace: Duration) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(
                binding_id = self.id,
                grace_ms = grace.as_millis() as u64,
                "Stream cancellation not acknowledged, aborting pump"
            );
            self.task.abort();
        }
    }
}

/// Consumer-side half of a bound stream.
///
/// Yields upstream messages in order. An `Err` item is terminal:
/// [`StreamError::Cancelled`] when the pool detached the stream, any other
/// variant for an upstream failure. `None` means the upstream ended
/// normally. Dropping this cancels the upstream stream and frees the entry
/// for a new binding.
#[derive(Debug)]
pub struct BoundStream {
    binding_id: u64,
    connection_id: u64,
    owner: OwnerId,
    rx: mpsc::Receiver<Delivery>,
}

impl BoundStream {
    /// Next message, terminal error, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    #[must_use]
    pub const fn binding_id(&self) -> u64 {
        self.binding_id
    }

    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }
}

enum Step {
    Cancel,
    ConsumerGone,
    Next(Option<Delivery>),
}

enum Forward {
    Cancel,
    Delivered,
    ConsumerGone,
}

struct Pump {
    binding_id: u64,
    connection_id: u64,
    owner: OwnerId,
    pool: Weak<PoolInner>,
}

impl Pump {
    async fn run(
        self,
        mut stream: Box<dyn SubscriptionStream>,
        mut cancel_rx: oneshot::Receiver<()>,
        tx: mpsc::Sender<Delivery>,
    ) {
        debug!(
            owner = %self.owner,
            connection_id = self.connection_id,
            binding_id = self.binding_id,
            "Stream bound"
        );

        loop {
            // A dropped sender (entry discarded with the pool) counts as cancellation.
            let step = tokio::select! {
                biased;
                _ = &mut cancel_rx => Step::Cancel,
                _ = tx.closed() => Step::ConsumerGone,
                next = stream.next_message() => Step::Next(next),
            };

            match step {
                Step::Cancel => {
                    self.cancel_upstream(stream.as_mut()).await;
                    let _ = tx.try_send(Err(StreamError::Cancelled));
                    return;
                }
                Step::ConsumerGone => {
                    self.consumer_gone(stream.as_mut()).await;
                    return;
                }
                Step::Next(Some(Ok(message))) => {
                    let forward = tokio::select! {
                        biased;
                        _ = &mut cancel_rx => Forward::Cancel,
                        sent = tx.send(Ok(message)) => match sent {
                            Ok(()) => Forward::Delivered,
                            Err(_) => Forward::ConsumerGone,
                        },
                    };
                    match forward {
                        Forward::Delivered => {}
                        Forward::Cancel => {
                            self.cancel_upstream(stream.as_mut()).await;
                            let _ = tx.try_send(Err(StreamError::Cancelled));
                            return;
                        }
                        Forward::ConsumerGone => {
                            self.consumer_gone(stream.as_mut()).await;
                            return;
                        }
                    }
                }
                Step::Next(Some(Err(err))) => {
                    if let Some(pool) = self.pool.upgrade() {
                        pool.stream_failed(self.connection_id, self.binding_id, &err);
                    }
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Step::Next(None) => {
                    debug!(
                        owner = %self.owner,
                        binding_id = self.binding_id,
                        "Stream ended"
                    );
                    if let Some(pool) = self.pool.upgrade() {
                        pool.stream_ended(self.connection_id, self.binding_id);
                    }
                    return;
                }
            }
        }
    }

    /// The `BoundStream` was dropped: cancel upstream and detach from the entry.
    async fn consumer_gone(&self, stream: &mut dyn SubscriptionStream) {
        debug!(
            owner = %self.owner,
            binding_id = self.binding_id,
            "Consumer dropped bound stream"
        );
        self.cancel_upstream(stream).await;
        if let Some(pool) = self.pool.upgrade() {
            pool.stream_ended(self.connection_id, self.binding_id);
        }
    }

    async fn cancel_upstream(&self, stream: &mut dyn SubscriptionStream) {
        match stream.cancel().await {
            Ok(()) => debug!(
                owner = %self.owner,
                binding_id = self.binding_id,
                "Stream cancelled"
            ),
            Err(err) => debug!(
                owner = %self.owner,
                binding_id = self.binding_id,
                error = %err,
                "Ignoring stream cancellation error"
            ),
        }
    }
}
