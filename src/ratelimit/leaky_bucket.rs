//! Leaky bucket.
//!
//! Admitted requests join a bounded queue that drains at a constant rate.
//! Once the queue is full, admissions are paced at exactly the leak rate.

use tracing::trace;

use super::decision::Decision;
use super::key::CallerKey;
use crate::store::{Store, StoreResult};

/// Let the caller's queue leak, then try to join it.
pub async fn check(
    store: &dyn Store,
    key: &CallerKey,
    rate: f64,
    burst: u64,
    now: u64,
) -> StoreResult<Decision> {
    let store_key = key.to_store_key();

    store.dequeue(&store_key, rate, now).await?;
    let accepted = store.enqueue(&store_key, burst, now).await?;
    trace!(key = %store_key, accepted, "Leaky bucket enqueue");

    Ok(Decision::new(accepted).with_limit(burst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::AlgorithmTag;
    use crate::ratelimit::testing::{memory_store, now};
    use std::time::Duration;

    fn caller(identity: &str) -> CallerKey {
        CallerKey::new(AlgorithmTag::LeakyBucket, identity)
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (store, clock) = memory_store(Duration::from_secs(9_000));
        let key = caller("alice");

        for _ in 0..3 {
            let decision = check(&store, &key, 1.0, 3, now(&clock)).await.unwrap();
            assert!(decision.is_admitted());
            assert_eq!(decision.limit, Some(3));
        }
        assert!(!check(&store, &key, 1.0, 3, now(&clock)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_one_slot_frees_per_interval() {
        let (store, clock) = memory_store(Duration::from_secs(9_000));
        let key = caller("alice");

        for _ in 0..3 {
            check(&store, &key, 2.0, 3, now(&clock)).await.unwrap();
        }

        clock.advance(Duration::from_millis(250));
        assert!(!check(&store, &key, 2.0, 3, now(&clock)).await.unwrap().is_admitted());

        // 1 / rate after the queue filled, one slot and only one opens up.
        clock.advance(Duration::from_millis(250));
        assert!(check(&store, &key, 2.0, 3, now(&clock)).await.unwrap().is_admitted());
        assert!(!check(&store, &key, 2.0, 3, now(&clock)).await.unwrap().is_admitted());

        clock.advance(Duration::from_millis(500));
        assert!(check(&store, &key, 2.0, 3, now(&clock)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_idle_queue_readmits_full_burst() {
        let (store, clock) = memory_store(Duration::from_secs(9_000));
        let key = caller("alice");

        for _ in 0..2 {
            check(&store, &key, 1.0, 2, now(&clock)).await.unwrap();
        }

        // After a long pause every stale entry can leak as new ones arrive.
        clock.advance(Duration::from_secs(60));
        assert!(check(&store, &key, 1.0, 2, now(&clock)).await.unwrap().is_admitted());
        assert!(check(&store, &key, 1.0, 2, now(&clock)).await.unwrap().is_admitted());
        assert!(!check(&store, &key, 1.0, 2, now(&clock)).await.unwrap().is_admitted());
    }
}
