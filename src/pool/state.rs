//! Connection pool internal state types.
//!
//! Everything here is guarded by the pool's single state lock; none of
//! these methods block or await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::binding::StreamBinding;
use crate::domain::id::OwnerId;
use crate::port::stream::{ClientHandle, StreamingClient};

/// A pooled upstream connection pinned to its current owner.
pub(super) struct ConnectionEntry {
    /// Unique ID, also the insertion order used to break LRU ties.
    pub(super) id: u64,
    pub(super) client: Arc<dyn StreamingClient>,
    pub(super) binding: Option<StreamBinding>,
    pub(super) created_at: Instant,
    pub(super) last_used_at: Instant,
    pub(super) healthy: bool,
    pub(super) owner: OwnerId,
}

impl ConnectionEntry {
    pub(super) fn new(id: u64, owner: OwnerId, client: Arc<dyn StreamingClient>) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            binding: None,
            created_at: now,
            last_used_at: now,
            healthy: true,
            owner,
        }
    }

    pub(super) fn handle(&self) -> ClientHandle {
        ClientHandle::new(self.id, Arc::clone(&self.client))
    }

    /// Mark the entry used; strictly monotonic even when the clock has not moved.
    pub(super) fn touch(&mut self) {
        let floor = self.last_used_at + Duration::from_nanos(1);
        self.last_used_at = Instant::now().max(floor);
    }

    pub(super) fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Entry map plus the owner index. Invariant: `owners` maps each owner to
/// exactly the entry whose `owner` field names it.
#[derive(Default)]
pub(super) struct PoolState {
    pub(super) entries: HashMap<u64, ConnectionEntry>,
    pub(super) owners: HashMap<OwnerId, u64>,
    /// Capacity reserved by acquires currently dialing outside the lock.
    pub(super) pending_dials: usize,
    pub(super) closed: bool,
}

impl PoolState {
    pub(super) fn occupied(&self) -> usize {
        self.entries.len() + self.pending_dials
    }

    pub(super) fn entry_for(&self, owner: &OwnerId) -> Option<&ConnectionEntry> {
        self.owners.get(owner).and_then(|id| self.entries.get(id))
    }

    pub(super) fn entry_for_mut(&mut self, owner: &OwnerId) -> Option<&mut ConnectionEntry> {
        let id = *self.owners.get(owner)?;
        self.entries.get_mut(&id)
    }

    pub(super) fn insert(&mut self, entry: ConnectionEntry) {
        self.owners.insert(entry.owner.clone(), entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub(super) fn remove(&mut self, id: u64) -> Option<ConnectionEntry> {
        let entry = self.entries.remove(&id)?;
        if self.owners.get(&entry.owner) == Some(&id) {
            self.owners.remove(&entry.owner);
        }
        Some(entry)
    }

    /// Healthy entry with the oldest `last_used_at`, ties to the oldest entry.
    pub(super) fn least_recently_used(&self) -> Option<u64> {
        self.entries
            .values()
            .filter(|e| e.healthy)
            .min_by_key(|e| (e.last_used_at, e.id))
            .map(|e| e.id)
    }

    /// Move entry `id` to `new_owner`, returning its previous owner.
    pub(super) fn reassign(&mut self, id: u64, new_owner: &OwnerId) -> Option<OwnerId> {
        let entry = self.entries.get_mut(&id)?;
        let previous = std::mem::replace(&mut entry.owner, new_owner.clone());
        entry.touch();
        if self.owners.get(&previous) == Some(&id) {
            self.owners.remove(&previous);
        }
        self.owners.insert(new_owner.clone(), id);
        Some(previous)
    }

    pub(super) fn stats(&self, max_connections: usize, rate_limit_remaining: u32) -> PoolStats {
        let healthy = self.entries.values().filter(|e| e.healthy).count();
        let mut owner_counts = BTreeMap::new();
        for entry in self.entries.values() {
            *owner_counts.entry(entry.owner.to_string()).or_insert(0) += 1;
        }
        PoolStats {
            total: self.entries.len(),
            healthy,
            unhealthy: self.entries.len() - healthy,
            bound_streams: self.entries.values().filter(|e| e.binding.is_some()).count(),
            max_connections,
            rate_limit_remaining,
            owner_counts,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of live entries.
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Entries with an active bound stream.
    pub bound_streams: usize,
    pub max_connections: usize,
    /// Whole rate-limit tokens currently available for new connections.
    pub rate_limit_remaining: u32,
    /// Entries per owner.
    pub owner_counts: BTreeMap<String, usize>,
}

/// Observability view of a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub connection_id: u64,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub healthy: bool,
    pub has_stream: bool,
}

impl From<&ConnectionEntry> for EntrySnapshot {
    fn from(entry: &ConnectionEntry) -> Self {
        Self {
            connection_id: entry.id,
            created_at: entry.created_at,
            last_used_at: entry.last_used_at,
            healthy: entry.healthy,
            has_stream: entry.binding.is_some(),
        }
    }
}
