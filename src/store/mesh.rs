//! Counter store shared across nodes through the gossip mesh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{CounterEntry, CounterStore};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::mesh::{Cluster, ClusterError, MergedEntry, MeshValue};

/// Default bound on a single store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// A counter store backed by chitchat cluster state.
///
/// Each operation is atomic against the local node's view of the cluster.
/// Other nodes observe the result on the next gossip round, so cluster-wide
/// limits are enforced with eventual consistency.
#[derive(Debug)]
pub struct MeshStore {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl MeshStore {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Stop publishing this node's expired counter and register keys.
    /// Returns how many keys were deleted.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        self.cluster
            .with_state(self.operation_timeout, |state| state.purge_expired(now))
            .await
            .map_err(|e| self.unavailable("*", e))
    }

    /// Periodically purge expired keys until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Purged expired mesh keys"),
                    Err(e) => warn!(error = %e, "Mesh key purge skipped"),
                }
            }
        })
    }

    fn unavailable(&self, key: &str, err: ClusterError) -> TollgateError {
        warn!(key, error = %err, "Mesh store operation failed");
        TollgateError::StorageUnavailable(err.to_string())
    }
}

fn entry_of(merged: &MergedEntry) -> CounterEntry {
    CounterEntry::new(merged.value, merged.stamp)
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        let now = self.clock.now_millis();
        self.cluster
            .with_state(self.operation_timeout, |state| {
                state.merged(key, now).as_ref().map(entry_of)
            })
            .await
            .map_err(|e| self.unavailable(key, e))
    }

    async fn get_or_create(
        &self,
        key: &str,
        initial: CounterEntry,
        ttl: Duration,
    ) -> Result<CounterEntry> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        self.cluster
            .with_state(self.operation_timeout, |state| {
                if let Some(existing) = state.merged(key, now) {
                    return entry_of(&existing);
                }
                state.write_register(
                    key,
                    MeshValue {
                        value: initial.value,
                        stamp: initial.stamp,
                        expires_at,
                        version: 1,
                    },
                );
                initial
            })
            .await
            .map_err(|e| self.unavailable(key, e))
    }

    async fn increment(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let value = self
            .cluster
            .with_state(self.operation_timeout, |state| {
                state.add_to_counter(key, delta, now, expires_at);
                state.merged(key, now).map_or(delta, |merged| merged.value)
            })
            .await
            .map_err(|e| self.unavailable(key, e))?;

        trace!(key, delta, value, "Incremented mesh counter");
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
        let expires_at = now.saturating_add(duration_millis(ttl));
        self.cluster
            .with_state(self.operation_timeout, |state| {
                let current = state.merged(key, now);
                if current.as_ref().map(entry_of).as_ref() != expected {
                    return false;
                }

                // Counter contributions stay in place, so the register holds
                // the part of the new value they do not already account for.
                let (counted, version) =
                    current.map_or((0.0, 0), |merged| (merged.counted, merged.version));
                state.write_register(
                    key,
                    MeshValue {
                        value: new.value - counted,
                        stamp: new.stamp,
                        expires_at,
                        version: version + 1,
                    },
                );
                true
            })
            .await
            .map_err(|e| self.unavailable(key, e))
    }
}
