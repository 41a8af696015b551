//! Leaky bucket: a bounded queue drained at a constant rate.

use tracing::debug;

use super::algorithm::{
    backoff, bucket_ttl, contention, flow, initial_stamp, period_millis, time_to_flow,
    CheckContext, Outcome,
};
use super::rule::LeakyBucket;
use crate::error::Result;
use crate::store::CounterEntry;

/// Drain the queue for the elapsed time and enqueue `cost` if it fits.
pub(crate) async fn check(bucket: &LeakyBucket, ctx: &CheckContext<'_>) -> Result<Outcome> {
    let period_ms = period_millis(bucket.outflow_period);
    let capacity = bucket.capacity as f64;
    let rate = bucket.outflow_rate;
    let cost = ctx.cost as f64;

    for attempt in 0..ctx.max_cas_retries {
        let current = ctx.store.get(ctx.key).await?;
        let (depth, stamp) = match current {
            Some(entry) => {
                let (drained, stamp) = flow(entry.stamp, ctx.now, rate, period_ms, ctx.alignment);
                ((entry.value - drained).clamp(0.0, capacity), stamp)
            }
            None => (0.0, initial_stamp(ctx.now, period_ms, ctx.alignment)),
        };

        if depth + cost > capacity {
            debug!(key = ctx.key, depth, cost, "Leaky bucket full");
            let overflow = depth + cost - capacity;
            return Ok(Outcome {
                is_limited: true,
                remaining: (capacity - depth) as u64,
                reset_after: time_to_flow(overflow, ctx.now, stamp, rate, period_ms, ctx.alignment),
            });
        }

        let queued = depth + cost;
        let next = CounterEntry::new(queued, stamp);
        let ttl = bucket_ttl(queued, rate, bucket.outflow_period);

        if ctx
            .store
            .compare_and_swap(ctx.key, current.as_ref(), next, ttl)
            .await?
        {
            return Ok(Outcome {
                is_limited: false,
                remaining: (capacity - queued) as u64,
                reset_after: time_to_flow(queued, ctx.now, stamp, rate, period_ms, ctx.alignment),
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

    struct Harness {
        store: MemoryStore,
        clock: ManualClock,
        bucket: LeakyBucket,
        alignment: StartAlignment,
    }

    impl Harness {
        fn new(bucket: LeakyBucket, alignment: StartAlignment, start: u64) -> Self {
            let clock = ManualClock::new(start);
            Self {
                store: MemoryStore::with_clock(Arc::new(clock.clone())),
                clock,
                bucket,
                alignment,
            }
        }

        async fn offer(&self) -> Outcome {
            let ctx = CheckContext {
                store: &self.store,
                key: "leaky:target",
                now: self.clock.now_millis(),
                cost: 1,
                alignment: self.alignment,
                max_cas_retries: 8,
            };
            check(&self.bucket, &ctx).await.unwrap()
        }

        async fn depth(&self) -> f64 {
            self.store
                .get("leaky:target")
                .await
                .unwrap()
                .map_or(0.0, |entry| entry.value)
        }
    }

    #[tokio::test]
    async fn test_fill_then_drain() {
        let h = Harness::new(
            LeakyBucket::new(20, 10, Duration::from_secs(1)),
            StartAlignment::FromCurrentTime,
            0,
        );

        for i in 0..20 {
            assert!(!h.offer().await.is_limited, "offer {} should be queued", i + 1);
        }
        let outcome = h.offer().await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.reset_after, Duration::from_millis(100));

        h.clock.advance(Duration::from_secs(1));
        let mut admitted = 0;
        for _ in 0..15 {
            if !h.offer().await.is_limited {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_depth_never_exceeds_capacity_and_rate_is_bounded() {
        let h = Harness::new(
            LeakyBucket::new(20, 10, Duration::from_secs(1)),
            StartAlignment::FromCurrentTime,
            1_000,
        );

        // Offer 10 operations every 100ms for 5 seconds (100/s against 10/s)
        let mut all_admissions = Vec::new();
        for tick in 0..50 {
            h.clock.set_millis(1_000 + tick * 100);
            for _ in 0..10 {
                if !h.offer().await.is_limited {
                    all_admissions.push(h.clock.now_millis());
                }
                assert!(h.depth().await <= 20.0);
            }
        }

        // Any 1s window admits at most outflow_rate + capacity
        for &start in &all_admissions {
            let in_window = all_admissions
                .iter()
                .filter(|&&t| t >= start && t < start + 1_000)
                .count();
            assert!(in_window <= 30, "{} admitted in 1s", in_window);
        }
        // Long-run throughput tracks the outflow rate
        assert!(all_admissions.len() <= 20 + 50);
    }

    #[tokio::test]
    async fn test_natural_alignment_drains_on_boundaries() {
        let h = Harness::new(
            LeakyBucket::new(2, 2, Duration::from_secs(1)),
            StartAlignment::FromNaturalPeriodBegin,
            5_500,
        );

        assert!(!h.offer().await.is_limited);
        assert!(!h.offer().await.is_limited);

        h.clock.set_millis(5_900);
        let outcome = h.offer().await;
        assert!(outcome.is_limited);
        assert_eq!(outcome.reset_after, Duration::from_millis(100));

        h.clock.set_millis(6_000);
        assert!(!h.offer().await.is_limited);
        assert_eq!(h.depth().await, 1.0);
    }

    #[tokio::test]
    async fn test_idle_bucket_expires_empty() {
        let h = Harness::new(
            LeakyBucket::new(5, 5, Duration::from_secs(1)),
            StartAlignment::FromCurrentTime,
            0,
        );

        for _ in 0..5 {
            h.offer().await;
        }
        h.clock.advance(Duration::from_secs(3));
        assert!(h.store.get("leaky:target").await.unwrap().is_none());
        assert_eq!(h.offer().await.remaining, 4);
    }
}
