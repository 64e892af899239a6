//! Sliding window log.
//!
//! Exact, at the cost of one stored timestamp per request in the window.
//! Rejected requests are logged as well, so a caller hammering the limit
//! stays limited until it backs off.

use std::time::Duration;

use tracing::trace;

use super::decision::Decision;
use super::key::CallerKey;
use crate::store::{Store, StoreResult};

/// Log this request and admit it if the log holds at most `limit` entries
/// from the trailing `window`.
pub async fn check(
    store: &dyn Store,
    key: &CallerKey,
    limit: u64,
    window: Duration,
    now: u64,
) -> StoreResult<Decision> {
    let store_key = key.to_store_key();
    let count = store.record_in_log(&store_key, now, window).await?;
    trace!(key = %store_key, count, limit, "Sliding log length");

    Ok(Decision::new(count <= limit)
        .with_limit(limit)
        .with_remaining(limit as i64 - count as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::AlgorithmTag;
    use crate::ratelimit::testing::{memory_store, now};

    const WINDOW: Duration = Duration::from_secs(10);

    fn caller(identity: &str) -> CallerKey {
        CallerKey::new(AlgorithmTag::SlidingWindowLog, identity)
    }

    #[tokio::test]
    async fn test_evenly_spread_requests_admitted() {
        let (store, clock) = memory_store(Duration::from_secs(7_777));
        let key = caller("alice");

        // Just over window / limit apart, so each entry has aged out by the
        // time the sixth one after it arrives.
        for i in 0..20 {
            let decision = check(&store, &key, 5, WINDOW, now(&clock)).await.unwrap();
            assert!(decision.is_admitted(), "request {} should be admitted", i);
            clock.advance(Duration::from_millis(2_001));
        }
    }

    #[tokio::test]
    async fn test_burst_over_limit_rejected() {
        let (store, clock) = memory_store(Duration::from_secs(7_777));
        let key = caller("alice");

        for _ in 0..3 {
            assert!(check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap().is_admitted());
            clock.advance(Duration::from_millis(100));
        }

        let decision = check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap();
        assert!(!decision.is_admitted());
        assert_eq!(decision.remaining, Some(-1));
    }

    #[tokio::test]
    async fn test_entry_on_boundary_still_counts() {
        let (store, clock) = memory_store(Duration::from_secs(7_777));
        let key = caller("alice");

        // Entries at t, t+1s, t+2s fill the limit.
        for _ in 0..3 {
            assert!(check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap().is_admitted());
            clock.advance(Duration::from_secs(1));
        }

        // At t+10s the first entry sits exactly on the boundary and still counts.
        clock.set(Duration::from_secs(7_777 + 10));
        assert!(!check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_entry_leaves_after_full_window() {
        let (store, clock) = memory_store(Duration::from_secs(7_777));
        let key = caller("alice");

        for _ in 0..3 {
            assert!(check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap().is_admitted());
            clock.advance(Duration::from_secs(1));
        }

        // Just past a full window from the first entry, it no longer counts.
        clock.set(Duration::from_secs(7_777 + 10) + Duration::from_millis(1));
        let decision = check(&store, &key, 3, WINDOW, now(&clock)).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, Some(0));
    }
}
