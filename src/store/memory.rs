//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterEntry, CounterStore};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct StoredEntry {
    entry: CounterEntry,
    expires_at: u64,
}

impl StoredEntry {
    fn new(entry: CounterEntry, now: u64, ttl: Duration) -> Self {
        Self {
            entry,
            expires_at: now.saturating_add(duration_millis(ttl)),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Memory-resident store for single-node deployments.
///
/// Entries live in a sharded map; the shard lock held by `entry()` makes each
/// operation atomic for its key without a global lock. Expired entries are
/// ignored on access and reclaimed by [`MemoryStore::purge_expired`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that expires entries against the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired entries until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, remaining = self.entries.len(), "Purged expired counters");
                }
            }
        })
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.entry))
    }

    async fn get_or_create(
        &self,
        key: &str,
        initial: CounterEntry,
        ttl: Duration,
    ) -> Result<CounterEntry> {
        let now = self.clock.now_millis();
        let entry = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    occupied.get().entry
                } else {
                    occupied.insert(StoredEntry::new(initial, now, ttl));
                    initial
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(initial, now, ttl));
                initial
            }
        };
        Ok(entry)
    }

    async fn increment(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let now = self.clock.now_millis();
        let value = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let stored = occupied.get_mut();
                stored.entry.value += delta;
                stored.entry.value
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(StoredEntry::new(CounterEntry::new(delta, now), now, ttl));
                delta
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(CounterEntry::new(delta, now), now, ttl));
                delta
            }
        };

        trace!(key, delta, value, "Incremented counter");
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&CounterEntry>,
        new: CounterEntry,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now_millis();
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|stored| stored.is_live(now))
                    .map(|stored| stored.entry);
                if current.as_ref() == expected {
                    occupied.insert(StoredEntry::new(new, now, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredEntry::new(new, now, ttl));
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }
}
