//! Token bucket.

use tracing::trace;

use super::decision::Decision;
use super::key::CallerKey;
use crate::store::{Store, StoreResult};

/// Take one token from the caller's bucket; admit if one was available.
///
/// The bucket starts full at `burst` and refills continuously at `rate`
/// tokens per second.
pub async fn check(
    store: &dyn Store,
    key: &CallerKey,
    rate: f64,
    burst: u64,
    now: u64,
) -> StoreResult<Decision> {
    let store_key = key.to_store_key();
    let granted = store.take_token(&store_key, rate, burst, now).await?;
    trace!(key = %store_key, granted, "Token bucket take");

    Ok(Decision::new(granted).with_limit(burst))
}
