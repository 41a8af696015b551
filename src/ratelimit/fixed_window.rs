//! Fixed window counting.
//!
//! Every attempt is counted, including rejected ones, so a client that keeps
//! retrying stays limited until the window rolls over. Two adjacent windows
//! can together admit up to twice the limit around their shared boundary.

use tracing::debug;

use super::algorithm::{
    backoff, contention, millis_until, natural_period_start, period_millis, CheckContext, Outcome,
};
use super::rule::{FixedWindow, StartAlignment};
use crate::error::Result;
use crate::store::CounterEntry;

pub(crate) async fn check(window: &FixedWindow, ctx: &CheckContext<'_>) -> Result<Outcome> {
    let window_ms = period_millis(window.stat_window);
    let cost = ctx.cost as f64;

    match ctx.alignment {
        StartAlignment::FromNaturalPeriodBegin => {
            // Each window gets its own key, so rollover is just a new entry.
            let start = natural_period_start(ctx.now, window_ms);
            let end = start + window_ms;
            let ttl = millis_until(ctx.now, end);
            let key = format!("{}:{}", ctx.key, start);

            ctx.store
                .get_or_create(&key, CounterEntry::new(0.0, start), ttl)
                .await?;
            let count = ctx.store.increment(&key, cost, ttl).await?;
            Ok(outcome(count, window.limit_number, ctx.now, end))
        }
        StartAlignment::FromCurrentTime => {
            for attempt in 0..ctx.max_cas_retries {
                let current = ctx.store.get(ctx.key).await?;
                let (start, count) = match current {
                    Some(entry) if ctx.now < entry.stamp.saturating_add(window_ms) => {
                        (entry.stamp, entry.value + cost)
                    }
                    _ => (ctx.now, cost),
                };
                let end = start + window_ms;

                let next = CounterEntry::new(count, start);
                let ttl = millis_until(ctx.now, end);
                if ctx
                    .store
                    .compare_and_swap(ctx.key, current.as_ref(), next, ttl)
                    .await?
                {
                    if current.is_none() {
                        debug!(key = ctx.key, window_start = start, "Opened fixed window");
                    }
                    return Ok(outcome(count, window.limit_number, ctx.now, end));
                }
                backoff(attempt).await;
            }

            Err(contention(ctx.key, ctx.max_cas_retries))
        }
    }
}

fn outcome(count: f64, limit: u64, now: u64, window_end: u64) -> Outcome {
    let count = count.max(0.0) as u64;
    Outcome {
        is_limited: count > limit,
        remaining: limit.saturating_sub(count),
        reset_after: millis_until(now, window_end),
    }
}
