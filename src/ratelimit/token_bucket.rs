//! Token bucket: bursts up to capacity, sustained rate set by the refill.

use tracing::debug;

use super::algorithm::{
    backoff, bucket_ttl, contention, flow, initial_stamp, period_millis, time_to_flow,
    CheckContext, Outcome,
};
use super::rule::TokenBucket;
use crate::error::Result;
use crate::store::CounterEntry;

/// Refill the bucket for the elapsed time and take `cost` tokens if they are
/// there. Refill and debit are committed together with one compare-and-swap,
/// so concurrent callers can never spend the same tokens twice.
pub(crate) async fn check(bucket: &TokenBucket, ctx: &CheckContext<'_>) -> Result<Outcome> {
    let period_ms = period_millis(bucket.refill_period);
    let capacity = bucket.capacity as f64;
    let rate = bucket.refill_rate;
    let cost = ctx.cost as f64;

    for attempt in 0..ctx.max_cas_retries {
        let current = ctx.store.get(ctx.key).await?;
        let (tokens, stamp) = match current {
            Some(entry) => {
                let (refill, stamp) = flow(entry.stamp, ctx.now, rate, period_ms, ctx.alignment);
                ((entry.value + refill).clamp(0.0, capacity), stamp)
            }
            None => (capacity, initial_stamp(ctx.now, period_ms, ctx.alignment)),
        };

        if tokens < cost {
            debug!(key = ctx.key, tokens, cost, "Token bucket exhausted");
            return Ok(Outcome {
                is_limited: true,
                remaining: tokens as u64,
                reset_after: time_to_flow(cost - tokens, ctx.now, stamp, rate, period_ms, ctx.alignment),
            });
        }

        let left = tokens - cost;
        let deficit = capacity - left;
        let next = CounterEntry::new(left, stamp);
        let ttl = bucket_ttl(deficit, rate, bucket.refill_period);

        if ctx
            .store
            .compare_and_swap(ctx.key, current.as_ref(), next, ttl)
            .await?
        {
            return Ok(Outcome {
                is_limited: false,
                remaining: left as u64,
                reset_after: time_to_flow(deficit, ctx.now, stamp, rate, period_ms, ctx.alignment),
            });
        }
        backoff(attempt).await;
    }

    Err(contention(ctx.key, ctx.max_cas_retries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::rule::StartAlignment;
    use crate::store::{CounterStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    async fn take(
        store: &MemoryStore,
        clock: &ManualClock,
        bucket: &TokenBucket,
        alignment: StartAlignment,
    ) -> Outcome {
        let ctx = CheckContext {
            store,
            key: "bucket:target",
            now: clock.now_millis(),
            cost: bucket.inflow_unit,
            alignment,
            max_cas_retries: 8,
        };
        check(bucket, &ctx).await.unwrap()
    }

    fn setup(start: u64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(start);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_drain_then_refill_after_idle() {
        let (store, clock) = setup(50_000);
        let bucket = TokenBucket::new(20, 10, Duration::from_secs(1));
        let alignment = StartAlignment::FromCurrentTime;

        for i in 0..20 {
            let outcome = take(&store, &clock, &bucket, alignment).await;
            assert!(!outcome.is_limited, "debit {} should succeed", i + 1);
        }
        let outcome = take(&store, &clock, &bucket, alignment).await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.reset_after, Duration::from_millis(100));

        clock.advance(Duration::from_secs(1));
        for i in 0..10 {
            let outcome = take(&store, &clock, &bucket, alignment).await;
            assert!(!outcome.is_limited, "refilled debit {} should succeed", i + 1);
        }
        assert!(take(&store, &clock, &bucket, alignment).await.is_limited);
    }

    #[tokio::test]
    async fn test_refill_saturates_at_capacity() {
        let (store, clock) = setup(0);
        let bucket = TokenBucket::new(20, 10, Duration::from_secs(1));
        let alignment = StartAlignment::FromCurrentTime;

        for _ in 0..5 {
            take(&store, &clock, &bucket, alignment).await;
        }

        // k = 7 idle periods would refill 70 tokens; the bucket holds 20
        clock.advance(Duration::from_secs(7));
        let outcome = take(&store, &clock, &bucket, alignment).await;
        assert_eq!(outcome.remaining, 19);
    }

    #[tokio::test]
    async fn test_inflow_unit_cost() {
        let (store, clock) = setup(0);
        let bucket = TokenBucket::new(10, 1, Duration::from_secs(1)).with_inflow_unit(4);
        let alignment = StartAlignment::FromCurrentTime;

        assert_eq!(take(&store, &clock, &bucket, alignment).await.remaining, 6);
        assert_eq!(take(&store, &clock, &bucket, alignment).await.remaining, 2);

        let outcome = take(&store, &clock, &bucket, alignment).await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.remaining, 2);
        // Two more tokens at one per second
        assert_eq!(outcome.reset_after, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_natural_alignment_refills_on_boundaries() {
        let (store, clock) = setup(10_400);
        let bucket = TokenBucket::new(2, 2, Duration::from_secs(1));
        let alignment = StartAlignment::FromNaturalPeriodBegin;

        assert!(!take(&store, &clock, &bucket, alignment).await.is_limited);
        assert!(!take(&store, &clock, &bucket, alignment).await.is_limited);

        // No refill until the next second begins
        clock.set_millis(10_999);
        let outcome = take(&store, &clock, &bucket, alignment).await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.reset_after, Duration::from_millis(1));

        clock.set_millis(11_000);
        assert!(!take(&store, &clock, &bucket, alignment).await.is_limited);
        assert!(!take(&store, &clock, &bucket, alignment).await.is_limited);
        assert!(take(&store, &clock, &bucket, alignment).await.is_limited);
    }

    #[tokio::test]
    async fn test_clock_going_backwards_never_goes_negative() {
        let (store, clock) = setup(10_000);
        let bucket = TokenBucket::new(3, 1, Duration::from_secs(1));
        let alignment = StartAlignment::FromCurrentTime;

        for _ in 0..3 {
            take(&store, &clock, &bucket, alignment).await;
        }
        clock.set_millis(5_000);
        let outcome = take(&store, &clock, &bucket, alignment).await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.remaining, 0);

        let entry = store.get("bucket:target").await.unwrap().unwrap();
        assert!(entry.value >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_exceed_capacity() {
        let (store, clock) = setup(0);
        let store = Arc::new(store);
        let bucket = TokenBucket::new(25, 1, Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            let now = clock.now_millis();
            handles.push(tokio::spawn(async move {
                let ctx = CheckContext {
                    store: store.as_ref(),
                    key: "bucket:shared",
                    now,
                    cost: 1,
                    alignment: StartAlignment::FromCurrentTime,
                    max_cas_retries: 1_000,
                };
                check(&bucket, &ctx).await.unwrap()
            }));
        }

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|outcome| !outcome.is_limited)
            .count();
        assert_eq!(admitted, 25);
    }
}
