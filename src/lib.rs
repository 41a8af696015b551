//! Tollgate - Rule-driven Request Admission
//!
//! This crate decides whether an operation may proceed by checking it against
//! an ordered set of rate limiting rules (fixed window, token bucket or leaky
//! bucket). Counters live in a pluggable store: in-process, or shared across
//! a peer-to-peer gossip mesh without centralized storage.

pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;
