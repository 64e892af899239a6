//! Sliding window counter.
//!
//! Approximates the sliding log with two fixed-window counters: the previous
//! window's count is weighted by how much of it still overlaps the trailing
//! window. Constant storage per caller, at the cost of exactness.

use std::time::Duration;

use tracing::trace;

use super::algorithm::window_nanos;
use super::decision::Decision;
use super::key::CallerKey;
use crate::store::{Store, StoreResult};

/// `previous × (1 − elapsed_fraction) + current`.
pub fn weighted_estimate(previous: u64, current: u64, elapsed_fraction: f64) -> f64 {
    previous as f64 * (1.0 - elapsed_fraction) + current as f64
}

/// Count this request in the current window and admit it if the weighted
/// estimate of the requests before it is below `limit`.
pub async fn check(
    store: &dyn Store,
    key: &CallerKey,
    limit: u64,
    window: Duration,
    now: u64,
) -> StoreResult<Decision> {
    let window_ns = window_nanos(window);
    let epoch = now / window_ns;
    let elapsed_fraction = (now % window_ns) as f64 / window_ns as f64;

    let previous = match epoch.checked_sub(1) {
        Some(prev_epoch) => store.get(&key.at_epoch(prev_epoch).to_store_key()).await?,
        None => 0,
    };

    // The counter outlives its own window so the next window can still
    // weigh it.
    let current_key = key.at_epoch(epoch).to_store_key();
    let current = store.increment(&current_key, window * 2).await?;

    // `current` already includes this request.
    let estimate = weighted_estimate(previous, current.saturating_sub(1), elapsed_fraction);
    let admitted = estimate < limit as f64;

    trace!(
        key = %current_key,
        previous,
        current,
        elapsed_fraction,
        estimate,
        "Sliding counter estimate"
    );

    Ok(Decision::new(admitted)
        .with_limit(limit)
        .with_remaining((limit as f64 - estimate - 1.0).floor() as i64))
}
