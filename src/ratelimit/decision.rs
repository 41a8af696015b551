//! Results handed back to adapters.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};

/// The result of checking one rule for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub rule_id: String,
    pub target: String,
    /// Strategy that produced the decision.
    pub algorithm: &'static str,
    pub is_limited: bool,
    /// Window quota or bucket capacity, for a `limit` response header.
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets, or until the bucket can take the next
    /// operation.
    #[serde(rename = "reset_after_ms", serialize_with = "as_millis")]
    pub reset_after: Duration,
    /// Epoch millis the decision was taken at.
    pub checked_at: u64,
    /// Set when the store failed and the configured failure policy decided
    /// instead of the algorithm.
    pub degraded: bool,
}

impl Decision {
    /// Wall-clock instant the limit resets.
    pub fn reset_at(&self) -> DateTime<Utc> {
        let reset = self
            .checked_at
            .saturating_add(u64::try_from(self.reset_after.as_millis()).unwrap_or(u64::MAX));
        let millis = i64::try_from(reset).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Aggregate result of checking one operation against the rule set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub is_limited: bool,
    /// Generation of the rule set the check ran against.
    pub generation: u64,
    /// Decisions of every rule that was evaluated, in rule order.
    pub decisions: Vec<Decision>,
}

impl CheckResult {
    pub(crate) fn admitted(generation: u64) -> Self {
        Self {
            is_limited: false,
            generation,
            decisions: Vec::new(),
        }
    }

    /// The first decision that limited the operation.
    pub fn limiting(&self) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.is_limited)
    }

    /// The decision with the least remaining capacity, which is what a
    /// `remaining` response header should report.
    pub fn tightest(&self) -> Option<&Decision> {
        self.limiting()
            .or_else(|| self.decisions.iter().min_by_key(|d| d.remaining))
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
