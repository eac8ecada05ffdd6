//! Owner-pinned connection pool for a rate-limited upstream streaming feed.
//!
//! The upstream provider caps both the number of concurrent connections and
//! how fast new ones may be created. The pool multiplexes that budget across
//! many long-running consumers ("owners"):
//!
//! - Each owner holds at most one entry; repeated [`acquire`](ConnectionPool::acquire)
//!   calls return the same connection while it stays healthy.
//! - Cache misses dial a new connection if the pool has room and the
//!   [`RateLimiter`] grants a token.
//! - A full pool reassigns the least-recently-used healthy entry to the
//!   requester, cancelling the stream its previous owner had bound.
//! - Entries stay pinned to their owner after [`release`](ConnectionPool::release);
//!   only the bound stream is cancelled, because a replacement costs a token.
//! - A background health check expires entries older than the TTL and prunes
//!   unhealthy ones. Expiry does not refund rate-limit tokens.
//!
//! All bookkeeping happens under one synchronous lock that is never held
//! across an `.await`. Dialing runs outside the lock against a capacity
//! reservation, and the decision is re-validated when the new entry is
//! committed.

mod binding;
mod health;
mod limiter;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use binding::BoundStream;
pub use limiter::RateLimiter;
pub use state::{EntrySnapshot, PoolStats};

use binding::StreamBinding;
use health::health_check_task;
use state::{ConnectionEntry, PoolState};

use crate::config::PoolConfig;
use crate::domain::id::OwnerId;
use crate::error::{PoolError, Result, StreamError};
use crate::port::stream::{ClientHandle, Connector, StreamingClient, SubscriptionStream};

/// Connection pool shared by all monitors.
///
/// Cloning is cheap and yields another handle to the same pool, so one
/// instance can be injected into every consumer. Dropping the last handle
/// stops the health check; call [`shutdown`](Self::shutdown) to tear down
/// streams deterministically.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    limiter: RateLimiter,
    state: Mutex<PoolState>,
    next_connection_id: AtomicU64,
    next_binding_id: AtomicU64,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

enum Decision {
    Reuse(ClientHandle),
    Reassign {
        handle: ClientHandle,
        evicted: Option<StreamBinding>,
    },
    Dial,
}

enum Commit {
    Created(ClientHandle),
    Retry,
}

impl ConnectionPool {
    /// Build a pool and start its health check.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails
    /// [`PoolConfig::validate`].
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            limiter: RateLimiter::from_config(&config.rate_limit),
            connector,
            state: Mutex::new(PoolState::default()),
            next_connection_id: AtomicU64::new(0),
            next_binding_id: AtomicU64::new(0),
            health_handle: Mutex::new(None),
            config,
        });

        let handle = tokio::spawn(health_check_task(
            Arc::downgrade(&inner),
            inner.config.health_check_interval(),
        ));
        *inner.health_handle.lock() = Some(handle);

        info!(
            endpoint = %inner.config.endpoint,
            max_connections = inner.config.max_connections,
            ttl_secs = inner.config.connection_ttl_secs,
            rate_limit = inner.config.rate_limit.capacity,
            rate_window_ms = inner.config.rate_limit.window_ms,
            "Connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection for `owner`.
    ///
    /// Returns the owner's cached connection when healthy, otherwise dials a
    /// new one or reassigns the least-recently-used entry of another owner.
    ///
    /// # Errors
    ///
    /// - [`PoolError::RateLimitExceeded`] when a new connection is needed but
    ///   no creation token is available
    /// - [`PoolError::NoConnectionsAvailable`] when the pool is full and no
    ///   healthy entry can be reassigned
    /// - [`PoolError::ConnectionCreationFailed`] when dialing fails or times out
    /// - [`PoolError::ShutDown`] after [`shutdown`](Self::shutdown)
    pub async fn acquire(
        &self,
        owner: impl Into<OwnerId>,
    ) -> std::result::Result<ClientHandle, PoolError> {
        let owner = owner.into();
        let grace = self.inner.config.cancel_grace();

        loop {
            let mut stale = None;
            let decision = self.inner.decide(&owner, &mut stale);
            if let Some(binding) = stale {
                binding.cancel(grace).await;
            }

            match decision? {
                Decision::Reuse(handle) => return Ok(handle),
                Decision::Reassign { handle, evicted } => {
                    if let Some(binding) = evicted {
                        binding.cancel(grace).await;
                    }
                    return Ok(handle);
                }
                Decision::Dial => match self.inner.dial(&owner).await? {
                    Commit::Created(handle) => return Ok(handle),
                    Commit::Retry => continue,
                },
            }
        }
    }

    /// Attach `stream` to the owner's entry and start forwarding it.
    ///
    /// Replaces (and cancels) any stream previously bound for this owner.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotAcquired`] when `owner` holds no healthy
    /// entry; the offered stream is cancelled.
    pub async fn bind_stream(
        &self,
        owner: impl Into<OwnerId>,
        stream: Box<dyn SubscriptionStream>,
    ) -> std::result::Result<BoundStream, PoolError> {
        let owner = owner.into();
        let grace = self.inner.config.cancel_grace();
        let binding_id = self.inner.next_binding_id.fetch_add(1, Ordering::Relaxed) + 1;

        let outcome = {
            let mut state = self.inner.state.lock();
            match state.entry_for_mut(&owner) {
                Some(entry) if entry.healthy => {
                    let (binding, bound) = StreamBinding::spawn(
                        binding_id,
                        entry.id,
                        owner.clone(),
                        stream,
                        self.inner.config.stream_buffer,
                        Arc::downgrade(&self.inner),
                    );
                    Ok((bound, entry.binding.replace(binding)))
                }
                _ => Err(stream),
            }
        };

        match outcome {
            Ok((bound, previous)) => {
                if let Some(previous) = previous {
                    debug!(owner = %owner, binding_id = previous.id, "Replacing bound stream");
                    previous.cancel(grace).await;
                }
                Ok(bound)
            }
            Err(mut stream) => {
                warn!(owner = %owner, "Cannot bind stream: owner holds no connection");
                match tokio::time::timeout(grace, stream.cancel()).await {
                    Ok(Err(err)) => debug!(error = %err, "Ignoring stream cancellation error"),
                    Err(_) => debug!("Stream cancellation timed out"),
                    Ok(Ok(())) => {}
                }
                Err(PoolError::NotAcquired { owner })
            }
        }
    }

    /// Cancel the owner's bound stream, keeping the connection pinned to it.
    ///
    /// Safe to call repeatedly and for owners the pool has never seen.
    pub async fn release(&self, owner: impl Into<OwnerId>) {
        let owner = owner.into();
        let binding = {
            let mut state = self.inner.state.lock();
            state.entry_for_mut(&owner).and_then(|e| e.binding.take())
        };

        match binding {
            Some(binding) => {
                debug!(owner = %owner, binding_id = binding.id, "Releasing bound stream");
                binding.cancel(self.inner.config.cancel_grace()).await;
            }
            None => debug!(owner = %owner, "Release: no bound stream"),
        }
    }

    /// Snapshot of pool counts and the rate-limit budget.
    pub fn stats(&self) -> PoolStats {
        let remaining = self.inner.limiter.available_tokens();
        self.inner
            .state
            .lock()
            .stats(self.inner.config.max_connections, remaining)
    }

    /// View of the entry currently pinned to `owner`.
    pub fn entry_snapshot(&self, owner: impl Into<OwnerId>) -> Option<EntrySnapshot> {
        let owner = owner.into();
        self.inner.state.lock().entry_for(&owner).map(EntrySnapshot::from)
    }

    /// The pool's connection-creation limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Stop the health check and tear down every entry.
    ///
    /// Streams are cancelled concurrently, each bounded by the smaller of
    /// the cancel grace period and the shutdown timeout. Returns once the
    /// pool is empty. Subsequent acquires fail with [`PoolError::ShutDown`].
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.health_handle.lock().take() {
            handle.abort();
        }

        let drained: Vec<ConnectionEntry> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.owners.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        info!(connections = drained.len(), "Shutting down connection pool");

        let limit = self
            .inner
            .config
            .cancel_grace()
            .min(self.inner.config.shutdown_timeout());
        join_all(drained.into_iter().map(|mut entry| async move {
            if let Some(binding) = entry.binding.take() {
                binding.cancel(limit).await;
            }
            debug!(connection_id = entry.id, owner = %entry.owner, "Connection closed");
        }))
        .await;

        info!("Connection pool shut down");
    }
}

impl PoolInner {
    /// Choose how to satisfy an acquire. Runs entirely under the state lock.
    ///
    /// An unhealthy entry found for `owner` is removed and its binding (if
    /// any) handed back through `stale` for cancellation outside the lock.
    fn decide(
        &self,
        owner: &OwnerId,
        stale: &mut Option<StreamBinding>,
    ) -> std::result::Result<Decision, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::ShutDown);
        }

        if let Some((id, healthy)) = state.entry_for(owner).map(|e| (e.id, e.healthy)) {
            if healthy {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.touch();
                    debug!(owner = %owner, connection_id = id, "Reusing connection");
                    return Ok(Decision::Reuse(entry.handle()));
                }
            } else if let Some(mut entry) = state.remove(id) {
                info!(owner = %owner, connection_id = id, "Discarding unhealthy connection");
                *stale = entry.binding.take();
            }
        }

        if state.occupied() < self.config.max_connections {
            if !self.limiter.try_acquire(1) {
                let retry_after = self.limiter.time_until_available(1);
                warn!(
                    owner = %owner,
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "Connection creation rate limited"
                );
                return Err(PoolError::RateLimitExceeded { retry_after });
            }
            state.pending_dials += 1;
            return Ok(Decision::Dial);
        }

        let Some(id) = state.least_recently_used() else {
            warn!(
                owner = %owner,
                max_connections = self.config.max_connections,
                "Pool full with no reassignable connection"
            );
            return Err(PoolError::NoConnectionsAvailable {
                max_connections: self.config.max_connections,
            });
        };

        let evicted = state.entries.get_mut(&id).and_then(|e| e.binding.take());
        let previous = state.reassign(id, owner);
        let handle = state
            .entries
            .get(&id)
            .map(ConnectionEntry::handle)
            .ok_or(PoolError::NoConnectionsAvailable {
                max_connections: self.config.max_connections,
            })?;
        info!(
            connection_id = id,
            from = %previous.map(|p| p.to_string()).unwrap_or_default(),
            to = %owner,
            "Reassigned least recently used connection"
        );
        Ok(Decision::Reassign { handle, evicted })
    }

    /// Dial outside the lock, then commit under it.
    async fn dial(&self, owner: &OwnerId) -> std::result::Result<Commit, PoolError> {
        let reservation = PendingDial::new(self);
        let result = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector
                .connect(&self.config.endpoint, &self.config.credential),
        )
        .await;
        self.commit(owner, result, reservation)
    }

    /// Install the dialed connection, settling `reservation` in the same
    /// critical section so its slot is never visible as free in between.
    fn commit(
        &self,
        owner: &OwnerId,
        result: std::result::Result<
            std::result::Result<Arc<dyn StreamingClient>, StreamError>,
            tokio::time::error::Elapsed,
        >,
        reservation: PendingDial<'_>,
    ) -> std::result::Result<Commit, PoolError> {
        let client = match result {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                warn!(owner = %owner, error = %err, "Failed to create connection");
                return Err(self.creation_failed(err.to_string()));
            }
            Err(_) => {
                warn!(owner = %owner, "Connection attempt timed out");
                return Err(self.creation_failed(format!(
                    "timed out after {}s",
                    self.config.connect_timeout_secs
                )));
            }
        };

        let mut state = self.state.lock();
        reservation.settle(&mut state);
        if state.closed {
            return Err(PoolError::ShutDown);
        }
        if state.entry_for(owner).is_some() {
            debug!(owner = %owner, "Owner gained a connection while dialing, retrying");
            return Ok(Commit::Retry);
        }
        if state.entries.len() >= self.config.max_connections {
            debug!(owner = %owner, "Pool filled while dialing, retrying");
            return Ok(Commit::Retry);
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ConnectionEntry::new(id, owner.clone(), client);
        let handle = entry.handle();
        state.insert(entry);
        info!(
            owner = %owner,
            connection_id = id,
            total = state.entries.len(),
            "Created upstream connection"
        );
        Ok(Commit::Created(handle))
    }

    fn creation_failed(&self, reason: String) -> PoolError {
        PoolError::ConnectionCreationFailed {
            endpoint: self.config.endpoint.clone(),
            reason,
        }
    }

    /// Hook: the bound stream failed on its own.
    pub(super) fn stream_failed(&self, connection_id: u64, binding_id: u64, err: &StreamError) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&connection_id) else {
            return;
        };
        if entry.binding.as_ref().map(|b| b.id) != Some(binding_id) {
            return;
        }
        entry.binding = None;
        entry.healthy = false;
        warn!(
            owner = %entry.owner,
            connection_id,
            binding_id,
            error = %err,
            "Stream failed, connection marked unhealthy"
        );
    }

    /// Hook: the bound stream closed normally.
    pub(super) fn stream_ended(&self, connection_id: u64, binding_id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&connection_id) {
            if entry.binding.as_ref().map(|b| b.id) == Some(binding_id) {
                entry.binding = None;
            }
        }
    }

    /// Remove expired and unhealthy entries, then cancel their streams.
    pub(super) async fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.config.connection_ttl();

        let removed: Vec<ConnectionEntry> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .entries
                .values()
                .filter(|e| !e.healthy || e.is_expired(now, ttl))
                .map(|e| e.id)
                .collect();
            ids.into_iter().filter_map(|id| state.remove(id)).collect()
        };

        if removed.is_empty() {
            return;
        }

        let grace = self.config.cancel_grace();
        join_all(removed.into_iter().map(|mut entry| async move {
            let expired = entry.is_expired(now, ttl);
            entry.healthy = false;
            info!(
                owner = %entry.owner,
                connection_id = entry.id,
                age_secs = now.saturating_duration_since(entry.created_at).as_secs(),
                reason = if expired { "ttl" } else { "unhealthy" },
                "Removing connection"
            );
            if let Some(binding) = entry.binding.take() {
                binding.cancel(grace).await;
            }
        }))
        .await;
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.health_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Capacity reserved while a dial runs outside the lock.
///
/// Settled under the state lock on commit, or released on drop if the dial
/// failed or the acquire future was abandoned.
struct PendingDial<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> PendingDial<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        Self { inner, armed: true }
    }

    fn settle(mut self, state: &mut PoolState) {
        state.pending_dials = state.pending_dials.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.pending_dials = state.pending_dials.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests;
