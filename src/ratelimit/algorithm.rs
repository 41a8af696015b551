//! Algorithm dispatch and the time math shared by all strategies.

use std::time::Duration;

use rand::Rng;

use super::rule::{LimitAlgorithm, StartAlignment};
use super::{fixed_window, leaky_bucket, token_bucket};
use crate::clock::duration_millis;
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Everything an algorithm needs to evaluate one rule for one target.
pub(crate) struct CheckContext<'a> {
    pub store: &'a dyn CounterStore,
    /// `rule_id:target`
    pub key: &'a str,
    pub now: u64,
    pub cost: u64,
    pub alignment: StartAlignment,
    pub max_cas_retries: u32,
}

/// What an algorithm decided for one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Outcome {
    pub is_limited: bool,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Evaluate `algorithm` against the store.
pub(crate) async fn evaluate(algorithm: &LimitAlgorithm, ctx: &CheckContext<'_>) -> Result<Outcome> {
    match algorithm {
        LimitAlgorithm::FixedWindow(window) => fixed_window::check(window, ctx).await,
        LimitAlgorithm::TokenBucket(bucket) => token_bucket::check(bucket, ctx).await,
        LimitAlgorithm::LeakyBucket(bucket) => leaky_bucket::check(bucket, ctx).await,
    }
}

/// Start of the natural period of length `period_ms` containing `now`.
pub(crate) fn natural_period_start(now: u64, period_ms: u64) -> u64 {
    now - now % period_ms
}

/// Milliseconds from `from` to `to`, zero if `to` is in the past.
pub(crate) fn millis_until(from: u64, to: u64) -> Duration {
    Duration::from_millis(to.saturating_sub(from))
}

/// Rate arithmetic shared by both bucket kinds: how many units flow in (or
/// out) between `since` and `now`, and the stamp the new state is taken at.
///
/// Continuous flow counts fractional periods and moves the stamp to `now`.
/// Natural alignment only counts whole periods completed at aligned
/// boundaries and moves the stamp to the last boundary crossed. A `now`
/// earlier than `since` flows nothing.
pub(crate) fn flow(
    since: u64,
    now: u64,
    rate: u64,
    period_ms: u64,
    alignment: StartAlignment,
) -> (f64, u64) {
    if now <= since {
        return (0.0, since);
    }

    match alignment {
        StartAlignment::FromCurrentTime => {
            let elapsed = (now - since) as f64;
            (elapsed / period_ms as f64 * rate as f64, now)
        }
        StartAlignment::FromNaturalPeriodBegin => {
            let boundary = natural_period_start(now, period_ms);
            if boundary <= since {
                return (0.0, since);
            }
            let periods = (boundary - since) / period_ms;
            let stamp = since + periods * period_ms;
            ((periods * rate) as f64, stamp)
        }
    }
}

/// Stamp a fresh bucket state is created at.
pub(crate) fn initial_stamp(now: u64, period_ms: u64, alignment: StartAlignment) -> u64 {
    match alignment {
        StartAlignment::FromCurrentTime => now,
        StartAlignment::FromNaturalPeriodBegin => natural_period_start(now, period_ms),
    }
}

/// Time for `units` to flow at `rate` per `period`, rounded up to whole
/// periods under natural alignment (measured from `stamp`).
pub(crate) fn time_to_flow(
    units: f64,
    now: u64,
    stamp: u64,
    rate: u64,
    period_ms: u64,
    alignment: StartAlignment,
) -> Duration {
    if units <= 0.0 {
        return Duration::ZERO;
    }

    match alignment {
        StartAlignment::FromCurrentTime => {
            let millis = (units / rate as f64 * period_ms as f64).ceil();
            Duration::from_millis(millis as u64)
        }
        StartAlignment::FromNaturalPeriodBegin => {
            let periods = (units / rate as f64).ceil() as u64;
            let at = stamp.saturating_add(periods.saturating_mul(period_ms));
            millis_until(now, at)
        }
    }
}

/// TTL for a bucket entry: once it has fully refilled (or drained) the entry
/// is equivalent to an absent one, plus one period of slack.
pub(crate) fn bucket_ttl(units_to_settle: f64, rate: u64, period: Duration) -> Duration {
    let periods = (units_to_settle.max(0.0) / rate as f64).ceil() as u32;
    period.saturating_mul(periods.saturating_add(1))
}

/// Wait before retrying a lost compare-and-swap.
pub(crate) async fn backoff(attempt: u32) {
    if attempt < 3 {
        tokio::task::yield_now().await;
        return;
    }

    let micros = {
        let ceiling = 50u64 << attempt.min(6);
        rand::thread_rng().gen_range(0..=ceiling)
    };
    tokio::time::sleep(Duration::from_micros(micros)).await;
}

pub(crate) fn contention(key: &str, attempts: u32) -> TollgateError {
    TollgateError::StorageUnavailable(format!(
        "gave up updating '{}' after {} conflicting writes",
        key, attempts
    ))
}

pub(crate) fn period_millis(period: Duration) -> u64 {
    duration_millis(period).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_period_start() {
        assert_eq!(natural_period_start(61_500, 60_000), 60_000);
        assert_eq!(natural_period_start(60_000, 60_000), 60_000);
        // 2024-01-01T13:45:10Z floors to UTC midnight
        let day = 86_400_000;
        assert_eq!(natural_period_start(1_704_116_710_000, day), 1_704_067_200_000);
    }

    #[test]
    fn test_continuous_flow() {
        let (units, stamp) = flow(1_000, 1_500, 10, 1_000, StartAlignment::FromCurrentTime);
        assert_eq!(units, 5.0);
        assert_eq!(stamp, 1_500);
    }

    #[test]
    fn test_natural_flow_counts_whole_periods() {
        let natural = StartAlignment::FromNaturalPeriodBegin;

        // Still inside the first period
        assert_eq!(flow(1_000, 1_900, 10, 1_000, natural), (0.0, 1_000));
        // Two boundaries crossed
        assert_eq!(flow(1_000, 3_200, 10, 1_000, natural), (20.0, 3_000));
    }

    #[test]
    fn test_backwards_time_flows_nothing() {
        for alignment in [StartAlignment::FromCurrentTime, StartAlignment::FromNaturalPeriodBegin] {
            assert_eq!(flow(5_000, 4_000, 10, 1_000, alignment), (0.0, 5_000));
        }
    }

    #[test]
    fn test_time_to_flow() {
        let continuous = StartAlignment::FromCurrentTime;
        assert_eq!(
            time_to_flow(5.0, 0, 0, 10, 1_000, continuous),
            Duration::from_millis(500)
        );
        assert_eq!(time_to_flow(0.0, 0, 0, 10, 1_000, continuous), Duration::ZERO);

        let natural = StartAlignment::FromNaturalPeriodBegin;
        assert_eq!(
            time_to_flow(15.0, 2_300, 2_000, 10, 1_000, natural),
            Duration::from_millis(1_700)
        );
    }

    #[test]
    fn test_bucket_ttl() {
        assert_eq!(bucket_ttl(0.0, 10, Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(bucket_ttl(15.0, 10, Duration::from_secs(1)), Duration::from_secs(3));
    }
}
