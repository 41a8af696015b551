//! Counter storage shared by all limiting algorithms.
//!
//! A store maps string keys to a [`CounterEntry`] that expires after a TTL.
//! Every mutating operation is atomic per key; algorithms build their
//! read-modify-write cycles out of these primitives and never mutate entries
//! any other way.

mod memory;
mod mesh;

pub use memory::MemoryStore;
pub use mesh::MeshStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// State held for one rule and target.
///
/// The same shape carries each algorithm's state: `(count, window_start)` for
/// fixed windows, `(tokens_remaining, last_refill)` for token buckets and
/// `(queue_depth, last_drain)` for leaky buckets. `stamp` is in epoch millis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub value: f64,
    pub stamp: u64,
}

impl CounterEntry {
    pub fn new(value: f64, stamp: u64) -> Self {
        Self { value, stamp }
    }
}

/// Atomic counter storage with per-key expiry.
///
/// An absent or expired entry is indistinguishable from one that was never
/// written.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Read the current entry for a key.
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>>;

    /// Store `initial` with the given TTL if the key is absent, otherwise
    /// return the existing entry unchanged. At most one concurrent caller
    /// initializes the key.
    async fn get_or_create(
        &self,
        key: &str,
        initial: CounterEntry,
        ttl: Duration,
    ) -> Result<CounterEntry>;

    /// Add `delta` to the entry's value and return the new value.
    ///
    /// An absent key is created at zero with the given TTL first. The TTL of
    /// an existing entry is left untouched.
    async fn increment(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64>;

    /// Replace the entry with `new` if it currently equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&CounterEntry>,
        new: CounterEntry,
        ttl: Duration,
    ) -> Result<bool>;
}
