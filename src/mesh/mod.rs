//! Peer mesh networking module using Chitchat.
//!
//! Nodes form a gossip cluster and exchange counter state so that a
//! [`MeshStore`](crate::store::MeshStore) can enforce limits across
//! several Tollgate instances without a central database.

mod cluster;

pub use cluster::{
    Cluster, ClusterConfig, ClusterError, ClusterState, MergedEntry, MeshValue, StateKey,
    StateKind,
};
