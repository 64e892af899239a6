//! Fixed window counter.
//!
//! Windows are aligned to the Unix epoch, not to a caller's first request,
//! so a burst straddling a boundary can see up to twice the limit.

use std::time::Duration;

use tracing::trace;

use super::algorithm::window_nanos;
use super::decision::Decision;
use super::key::CallerKey;
use crate::store::{Store, StoreResult};

/// Count this request in the current window and admit it while the count
/// stays within `limit`.
pub async fn check(
    store: &dyn Store,
    key: &CallerKey,
    limit: u64,
    window: Duration,
    now: u64,
) -> StoreResult<Decision> {
    let epoch = now / window_nanos(window);
    let store_key = key.at_epoch(epoch).to_store_key();

    let count = store.increment(&store_key, window).await?;
    trace!(key = %store_key, count, limit, "Fixed window count");

    Ok(Decision::new(count <= limit)
        .with_limit(limit)
        .with_remaining(limit as i64 - count as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::AlgorithmTag;
    use crate::ratelimit::testing::{memory_store, now};

    const WINDOW: Duration = Duration::from_secs(60);

    fn caller(identity: &str) -> CallerKey {
        CallerKey::new(AlgorithmTag::FixedWindow, identity)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        // 1_000_020 is a multiple of 60: the start of a window.
        let (store, clock) = memory_store(Duration::from_secs(1_000_020));
        let key = caller("alice");

        for i in 1..=5 {
            let decision = check(&store, &key, 5, WINDOW, now(&clock)).await.unwrap();
            assert!(decision.is_admitted(), "request {} should be admitted", i);
            assert_eq!(decision.remaining, Some(5 - i));
            clock.advance(Duration::from_secs(1));
        }

        let decision = check(&store, &key, 5, WINDOW, now(&clock)).await.unwrap();
        assert!(!decision.is_admitted());
        assert_eq!(decision.limit, Some(5));
        assert_eq!(decision.remaining, Some(-1));
    }

    #[tokio::test]
    async fn test_next_window_admits_again() {
        let (store, clock) = memory_store(Duration::from_secs(1_000_020));
        let key = caller("alice");

        for _ in 0..3 {
            check(&store, &key, 2, WINDOW, now(&clock)).await.unwrap();
        }
        assert!(!check(&store, &key, 2, WINDOW, now(&clock)).await.unwrap().is_admitted());

        clock.advance(WINDOW);
        let decision = check(&store, &key, 2, WINDOW, now(&clock)).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, Some(1));
    }

    #[tokio::test]
    async fn test_boundary_burst_is_not_smoothed() {
        let (store, clock) = memory_store(Duration::from_secs(1_000_020 + 59));
        let key = caller("alice");

        // Exhaust the last second of one window...
        assert!(check(&store, &key, 1, WINDOW, now(&clock)).await.unwrap().is_admitted());
        // ...and a second later a fresh window opens.
        clock.advance(Duration::from_secs(1));
        assert!(check(&store, &key, 1, WINDOW, now(&clock)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_callers_are_independent() {
        let (store, clock) = memory_store(Duration::from_secs(1_000_020));

        assert!(check(&store, &caller("a"), 1, WINDOW, now(&clock)).await.unwrap().is_admitted());
        assert!(check(&store, &caller("b"), 1, WINDOW, now(&clock)).await.unwrap().is_admitted());
        assert!(!check(&store, &caller("a"), 1, WINDOW, now(&clock)).await.unwrap().is_admitted());
    }
}
