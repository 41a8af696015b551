//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of counter state between nodes.
//!
//! Every node only writes its own key-value state. A logical counter entry is
//! reconstructed on read from all live nodes:
//! - increments are per-node contributions under a `counter|` key and are
//!   summed (a grow-only counter per window);
//! - created or swapped entries are versioned registers under a `register|`
//!   key, and the highest version wins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to stop cluster: {0}")]
    ShutdownError(String),
    #[error("Timed out after {0:?} waiting for cluster state")]
    Timeout(Duration),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tollgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Which kind of per-node state a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Counter,
    Register,
}

impl StateKind {
    fn prefix(&self) -> &'static str {
        match self {
            StateKind::Counter => "counter",
            StateKind::Register => "register",
        }
    }
}

/// Key identifying one node's share of a counter entry in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub kind: StateKind,
    /// The store key (`rule:target[:window]`).
    pub key: String,
}

impl StateKey {
    pub fn counter(key: &str) -> Self {
        Self {
            kind: StateKind::Counter,
            key: key.to_string(),
        }
    }

    pub fn register(key: &str) -> Self {
        Self {
            kind: StateKind::Register,
            key: key.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "{kind}|{key}"
    pub fn to_chitchat_key(&self) -> String {
        format!("{}|{}", self.kind.prefix(), self.key)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let (prefix, rest) = key.split_once('|')?;
        let kind = match prefix {
            "counter" => StateKind::Counter,
            "register" => StateKind::Register,
            _ => return None,
        };
        if rest.is_empty() {
            return None;
        }

        Some(Self {
            kind,
            key: rest.to_string(),
        })
    }
}

/// One node's gossiped value for a state key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshValue {
    pub value: f64,
    pub stamp: u64,
    /// Wall-clock millis after which the value is ignored.
    pub expires_at: u64,
    /// Register version; unused for counters.
    pub version: u64,
}

impl MeshValue {
    /// Format: "{value}|{stamp}|{expires_at}|{version}"
    pub fn encode(&self) -> String {
        format!("{}|{}|{}|{}", self.value, self.stamp, self.expires_at, self.version)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.split('|');
        let value = parts.next()?.parse().ok()?;
        let stamp = parts.next()?.parse().ok()?;
        let expires_at = parts.next()?.parse().ok()?;
        let version = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            value,
            stamp,
            expires_at,
            version,
        })
    }

    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// A logical entry reconstructed from every live node's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedEntry {
    /// Register value plus the sum of all counter contributions.
    pub value: f64,
    pub stamp: u64,
    /// Sum of the live counter contributions alone.
    pub counted: f64,
    /// Highest register version seen, 0 if there is none.
    pub version: u64,
}

/// Exclusive access to the local chitchat state for one atomic operation.
pub struct ClusterState<'a> {
    guard: MutexGuard<'a, Chitchat>,
}

impl ClusterState<'_> {
    /// Reconstruct the logical entry for a store key at time `now`.
    pub fn merged(&self, key: &str, now: u64) -> Option<MergedEntry> {
        let counter_key = StateKey::counter(key).to_chitchat_key();
        let register_key = StateKey::register(key).to_chitchat_key();

        let mut register: Option<MeshValue> = None;
        let mut counted: Option<(f64, u64)> = None;

        for node_id in self.guard.live_nodes() {
            let Some(node_state) = self.guard.node_state(node_id) else {
                continue;
            };

            if let Some(value) = node_state
                .get(&register_key)
                .and_then(MeshValue::decode)
                .filter(|v| v.is_live(now))
            {
                if register.map_or(true, |current| value.version > current.version) {
                    register = Some(value);
                }
            }

            if let Some(value) = node_state
                .get(&counter_key)
                .and_then(MeshValue::decode)
                .filter(|v| v.is_live(now))
            {
                counted = Some(match counted {
                    Some((total, stamp)) => (total + value.value, stamp.min(value.stamp)),
                    None => (value.value, value.stamp),
                });
            }
        }

        match (register, counted) {
            (None, None) => None,
            (Some(register), None) => Some(MergedEntry {
                value: register.value,
                stamp: register.stamp,
                counted: 0.0,
                version: register.version,
            }),
            (None, Some((total, stamp))) => Some(MergedEntry {
                value: total,
                stamp,
                counted: total,
                version: 0,
            }),
            (Some(register), Some((total, _))) => Some(MergedEntry {
                value: register.value + total,
                stamp: register.stamp,
                counted: total,
                version: register.version,
            }),
        }
    }

    /// Add `amount` to this node's contribution for a store key.
    ///
    /// A missing or expired contribution restarts at zero with a fresh expiry.
    pub fn add_to_counter(&mut self, key: &str, amount: f64, now: u64, expires_at: u64) {
        let chitchat_key = StateKey::counter(key).to_chitchat_key();
        let node_state = self.guard.self_node_state();

        let next = match node_state
            .get(&chitchat_key)
            .and_then(MeshValue::decode)
            .filter(|v| v.is_live(now))
        {
            Some(current) => MeshValue {
                value: current.value + amount,
                ..current
            },
            None => MeshValue {
                value: amount,
                stamp: now,
                expires_at,
                version: 0,
            },
        };

        node_state.set(&chitchat_key, next.encode());

        debug!(
            key = %chitchat_key,
            local_value = next.value,
            "Incremented local counter"
        );
    }

    /// Publish a new register value from this node.
    pub fn write_register(&mut self, key: &str, value: MeshValue) {
        let chitchat_key = StateKey::register(key).to_chitchat_key();
        self.guard.self_node_state().set(&chitchat_key, value.encode());
    }

    /// Delete this node's expired counter and register keys so they stop
    /// being gossiped. Returns how many keys were deleted.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let node_state = self.guard.self_node_state();
        let expired: Vec<String> = node_state
            .key_values()
            .filter(|(key, _)| StateKey::from_chitchat_key(key).is_some())
            .filter(|(_, raw)| MeshValue::decode(raw).map_or(false, |v| !v.is_live(now)))
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &expired {
            node_state.delete(key);
        }
        expired.len()
    }

    /// Number of counter and register keys this node currently publishes.
    pub fn local_key_count(&mut self) -> usize {
        self.guard
            .self_node_state()
            .key_values()
            .filter(|(key, _)| StateKey::from_chitchat_key(key).is_some())
            .count()
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Run `f` with exclusive access to the local cluster state.
    ///
    /// Fails with [`ClusterError::Timeout`] if the state cannot be locked
    /// within `timeout`.
    pub async fn with_state<F, R>(&self, timeout: Duration, f: F) -> Result<R, ClusterError>
    where
        F: FnOnce(&mut ClusterState<'_>) -> R,
    {
        let chitchat = self.handle.chitchat();
        let guard = tokio::time::timeout(timeout, chitchat.lock())
            .await
            .map_err(|_| ClusterError::Timeout(timeout))?;
        let mut state = ClusterState { guard };
        Ok(f(&mut state))
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_state_key() {
        let key = StateKey::counter("api:10.0.0.1:1704067200000");
        let chitchat_key = key.to_chitchat_key();
        assert_eq!(chitchat_key, "counter|api:10.0.0.1:1704067200000");

        let parsed = StateKey::from_chitchat_key(&chitchat_key).unwrap();
        assert_eq!(parsed, key);

        let register = StateKey::from_chitchat_key("register|a|b").unwrap();
        assert_eq!(register.kind, StateKind::Register);
        assert_eq!(register.key, "a|b");
    }

    #[test]
    fn test_state_key_parsing_invalid() {
        assert!(StateKey::from_chitchat_key("invalid").is_none());
        assert!(StateKey::from_chitchat_key("counter|").is_none());
        assert!(StateKey::from_chitchat_key("notcounter|a").is_none());
    }

    #[test]
    fn test_mesh_value_encoding() {
        let value = MeshValue {
            value: 12.5,
            stamp: 1000,
            expires_at: 2000,
            version: 3,
        };
        assert_eq!(value.encode(), "12.5|1000|2000|3");
        assert_eq!(MeshValue::decode("12.5|1000|2000|3"), Some(value));
        assert_eq!(MeshValue::decode("12.5|1000|2000"), None);
        assert_eq!(MeshValue::decode("x|1|2|3"), None);
        assert_eq!(MeshValue::decode("1|1|2|3|4"), None);
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let config = test_config(17946);
        let cluster = Cluster::start(config).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_counter_and_register_merge() {
        let config = test_config(17947);
        let cluster = Cluster::start(config).await.unwrap();

        cluster
            .with_state(LOCK_TIMEOUT, |state| {
                state.write_register(
                    "k",
                    MeshValue {
                        value: 0.0,
                        stamp: 100,
                        expires_at: 10_000,
                        version: 1,
                    },
                );
                state.add_to_counter("k", 5.0, 100, 10_000);
                state.add_to_counter("k", 3.0, 150, 10_000);
            })
            .await
            .unwrap();

        let merged = cluster
            .with_state(LOCK_TIMEOUT, |state| state.merged("k", 200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.value, 8.0);
        assert_eq!(merged.counted, 8.0);
        assert_eq!(merged.stamp, 100);
        assert_eq!(merged.version, 1);

        // Everything expired
        let merged = cluster
            .with_state(LOCK_TIMEOUT, |state| state.merged("k", 10_000))
            .await
            .unwrap();
        assert!(merged.is_none());

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_deletes_local_keys() {
        let cluster = Cluster::start(test_config(17950)).await.unwrap();

        let (purged, remaining) = cluster
            .with_state(LOCK_TIMEOUT, |state| {
                state.add_to_counter("old", 1.0, 0, 1_000);
                state.write_register(
                    "old",
                    MeshValue {
                        value: 0.0,
                        stamp: 0,
                        expires_at: 1_000,
                        version: 1,
                    },
                );
                state.add_to_counter("current", 1.0, 0, 5_000);
                assert_eq!(state.local_key_count(), 3);

                (state.purge_expired(1_000), state.local_key_count())
            })
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(remaining, 1);

        // A purged key can be written again
        let merged = cluster
            .with_state(LOCK_TIMEOUT, |state| {
                state.add_to_counter("old", 2.0, 1_000, 2_000);
                state.merged("old", 1_000)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.value, 2.0);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes() {
        // Start first node
        let config1 = test_config(17948);
        let cluster1 = Cluster::start(config1).await.unwrap();

        // Start second node with first as seed
        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        let expires_at = u64::MAX;
        cluster1
            .with_state(LOCK_TIMEOUT, |state| state.add_to_counter("shared", 10.0, 0, expires_at))
            .await
            .unwrap();

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        let seen = cluster2
            .with_state(LOCK_TIMEOUT, |state| state.merged("shared", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.value, 10.0);

        cluster2
            .with_state(LOCK_TIMEOUT, |state| state.add_to_counter("shared", 5.0, 0, expires_at))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        for cluster in [&cluster1, &cluster2] {
            let seen = cluster
                .with_state(LOCK_TIMEOUT, |state| state.merged("shared", 1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen.value, 15.0);
        }

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
