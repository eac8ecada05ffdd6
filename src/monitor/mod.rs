//! Monitor adapter: how long-lived consumers use the connection pool.
//!
//! A [`Monitor`] describes what to subscribe to and how to handle messages.
//! [`MonitorAdapter`] drives it against a [`ConnectionPool`]:
//!
//! ```text
//! Disconnected --acquire + bind ok--> Connected
//! Connected    --stream error------> Disconnected (failure recorded, backoff)
//! Disconnected --backoff exhausted--> Failed   (terminal)
//! any          --stop()------------> Stopped  (terminal)
//! ```
//!
//! The connection is obtained lazily and cached; any stream-level error
//! invalidates the cached handle and releases the owner's stream before
//! retrying. Retries are an explicit bounded loop.

mod backoff;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use backoff::Backoff;

use crate::config::BackoffConfig;
use crate::domain::id::OwnerId;
use crate::error::{Error, MonitorError, PoolError, Result, StreamError};
use crate::pool::ConnectionPool;
use crate::port::stream::{ClientHandle, StreamMessage, SubscribeRequest, SubscriptionStream};

/// A long-lived consumer of the upstream feed.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Pool owner identity; stable for the monitor's lifetime.
    fn owner_id(&self) -> OwnerId;

    /// Request written to every freshly opened stream.
    fn subscribe_request(&self) -> SubscribeRequest;

    /// Handle one upstream message.
    ///
    /// Errors are logged and do not affect the connection.
    async fn on_message(&self, message: StreamMessage) -> Result<()>;
}

/// Lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connected,
    Stopped,
    Failed,
}

impl MonitorState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Drives a [`Monitor`] with lazy acquisition, backoff and release-on-stop.
pub struct MonitorAdapter {
    shared: Arc<Shared>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

struct Shared {
    pool: ConnectionPool,
    monitor: Arc<dyn Monitor>,
    owner: OwnerId,
    backoff: BackoffConfig,
    state_tx: watch::Sender<MonitorState>,
    stop_tx: watch::Sender<bool>,
}

enum Retry {
    Again,
    Stop,
    Exhausted(Error),
}

enum Session {
    Stopped,
    Ended { delivered: bool },
    Failed(Error),
}

impl MonitorAdapter {
    pub fn new(pool: ConnectionPool, monitor: Arc<dyn Monitor>, backoff: BackoffConfig) -> Self {
        let owner = monitor.owner_id();
        let (state_tx, _) = watch::channel(MonitorState::Disconnected);
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                pool,
                monitor,
                owner,
                backoff,
                state_tx,
                stop_tx,
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.shared.owner
    }

    /// Spawn the monitor loop. No-op if already started or stopped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(owner = %self.shared.owner, "Monitor already started");
            return;
        }
        if *self.shared.stop_tx.borrow() {
            debug!(owner = %self.shared.owner, "Monitor stopped before start");
            return;
        }
        let shared = self.shared.clone();
        *self.task.lock() = Some(tokio::spawn(shared.run()));
    }

    /// Stop the monitor and release its pooled stream.
    ///
    /// Idempotent, and safe to call before [`start`](Self::start).
    pub async fn stop(&self) {
        self.shared.stop_tx.send_replace(true);

        if self.started.load(Ordering::SeqCst) && self.task_running() {
            let mut states = self.shared.state_tx.subscribe();
            let _ = states.wait_for(|s| s.is_terminal()).await;
        } else if !self.state().is_terminal() {
            self.shared.state_tx.send_replace(MonitorState::Stopped);
        }

        self.shared.pool.release(self.shared.owner.clone()).await;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<MonitorState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait for the monitor loop to finish.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::RetriesExhausted`] when the monitor failed, or
    /// [`MonitorError::TaskFailed`] if its task panicked.
    pub async fn wait(&self) -> Result<()> {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(err) => {
                self.shared.state_tx.send_replace(MonitorState::Failed);
                Err(MonitorError::TaskFailed {
                    owner: self.shared.owner.clone(),
                    reason: err.to_string(),
                }
                .into())
            }
        }
    }

    fn task_running(&self) -> bool {
        match self.task.lock().as_ref() {
            Some(handle) => !handle.is_finished(),
            // Handle taken by `wait`; the loop publishes a terminal state on exit.
            None => !self.state().is_terminal(),
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut client: Option<ClientHandle> = None;

        info!(owner = %self.owner, "Monitor started");

        let result = loop {
            if *stop_rx.borrow() {
                break Ok(());
            }

            let handle = match client.clone() {
                Some(handle) => handle,
                None => {
                    let acquired = tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop_rx) => None,
                        acquired = self.pool.acquire(self.owner.clone()) => Some(acquired),
                    };
                    match acquired {
                        None => break Ok(()),
                        Some(Ok(handle)) => {
                            client = Some(handle.clone());
                            handle
                        }
                        Some(Err(PoolError::ShutDown)) => {
                            info!(owner = %self.owner, "Pool shut down, monitor stopping");
                            break Ok(());
                        }
                        Some(Err(err)) => {
                            match self.retry_after(&mut backoff, err.into(), &mut stop_rx).await {
                                Retry::Again => continue,
                                Retry::Stop => break Ok(()),
                                Retry::Exhausted(err) => break Err(err),
                            }
                        }
                    }
                }
            };

            let session = self.stream_session(&handle, &mut backoff, &mut stop_rx).await;

            // Every session end invalidates the cached handle.
            client = None;
            let failure = match session {
                Session::Stopped => break Ok(()),
                Session::Ended { delivered: true } => {
                    self.pool.release(self.owner.clone()).await;
                    self.state_tx.send_replace(MonitorState::Disconnected);
                    continue;
                }
                Session::Ended { delivered: false } => {
                    Error::Stream(StreamError::Transport("stream ended before any message".into()))
                }
                Session::Failed(err) => err,
            };

            self.pool.release(self.owner.clone()).await;
            match self.retry_after(&mut backoff, failure, &mut stop_rx).await {
                Retry::Again => {}
                Retry::Stop => break Ok(()),
                Retry::Exhausted(err) => break Err(err),
            }
        };

        self.pool.release(self.owner.clone()).await;
        match &result {
            Ok(()) => {
                info!(owner = %self.owner, "Monitor stopped");
                self.state_tx.send_replace(MonitorState::Stopped);
            }
            Err(err) => {
                error!(owner = %self.owner, error = %err, "Monitor failed");
                self.state_tx.send_replace(MonitorState::Failed);
            }
        }
        result
    }

    /// Record a failure and sleep out the backoff delay.
    async fn retry_after(
        &self,
        backoff: &mut Backoff,
        err: Error,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Retry {
        self.state_tx.send_replace(MonitorState::Disconnected);

        let Some(delay) = backoff.record_failure() else {
            return Retry::Exhausted(
                MonitorError::RetriesExhausted {
                    owner: self.owner.clone(),
                    attempts: backoff.failures(),
                    last: Box::new(err),
                }
                .into(),
            );
        };

        warn!(
            owner = %self.owner,
            attempt = backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Monitor retrying after backoff"
        );

        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => Retry::Stop,
            _ = tokio::time::sleep(delay) => Retry::Again,
        }
    }

    /// Open, subscribe, bind and consume one stream until it ends.
    async fn stream_session(
        &self,
        handle: &ClientHandle,
        backoff: &mut Backoff,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Session {
        let opened = tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => return Session::Stopped,
            opened = open_subscribed(handle, self.monitor.subscribe_request()) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(err) => return Session::Failed(err.into()),
        };

        let mut bound = match self.pool.bind_stream(self.owner.clone(), stream).await {
            Ok(bound) => bound,
            Err(err) => return Session::Failed(err.into()),
        };

        self.state_tx.send_replace(MonitorState::Connected);
        info!(
            owner = %self.owner,
            connection_id = bound.connection_id(),
            "Monitor connected"
        );

        let mut delivered = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(stop_rx) => return Session::Stopped,
                next = bound.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if !delivered {
                        delivered = true;
                        backoff.reset();
                    }
                    if let Err(err) = self.monitor.on_message(message).await {
                        warn!(owner = %self.owner, error = %err, "Monitor failed to handle message");
                    }
                }
                Some(Err(err)) => {
                    warn!(owner = %self.owner, error = %err, "Monitor stream error");
                    return Session::Failed(err.into());
                }
                None => {
                    info!(owner = %self.owner, "Monitor stream ended");
                    return Session::Ended { delivered };
                }
            }
        }
    }
}

async fn open_subscribed(
    handle: &ClientHandle,
    request: SubscribeRequest,
) -> std::result::Result<Box<dyn SubscriptionStream>, StreamError> {
    let mut stream = handle.open_stream().await?;
    stream.send(request).await?;
    Ok(stream)
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}
