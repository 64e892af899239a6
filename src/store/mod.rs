//! Storage capability shared by every rate limiting algorithm.
//!
//! Algorithms only ever talk to a [`Store`]; they never know whether state
//! lives in this process ([`MemoryStore`]) or in Redis ([`RedisStore`]).
//! Every mutating operation must be linearizable per key.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::StoreConfig;

pub use self::memory::{MemoryStore, MemoryStoreConfig, SweeperHandle};
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised by a storage backend.
///
/// Both variants mean the same thing to a caller: the decision could not be
/// made. Whether that fails open or closed is up to the caller.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or returned garbage.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish before its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether the decision is indeterminate because of this error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations a backend must provide to host the rate limiting algorithms.
///
/// Timestamps are nanoseconds since the Unix epoch.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically increment the counter at `key` and return the new value.
    ///
    /// The first increment of a fresh (or expired) counter starts its expiry
    /// at `window`.
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64>;

    /// Read a counter without touching it. Absent counters read as zero.
    async fn get(&self, key: &str) -> StoreResult<u64>;

    /// Read a counter together with the time left before it expires.
    async fn get_with_ttl(&self, key: &str) -> StoreResult<(u64, Option<Duration>)>;

    /// Append one timestamp to the list at `key`. Duplicates are kept.
    async fn add_to_list(&self, key: &str, timestamp: u64) -> StoreResult<()>;

    /// Remove every list member strictly older than `min_timestamp`.
    async fn trim_list(&self, key: &str, min_timestamp: u64) -> StoreResult<()>;

    /// Number of members in the list at `key`.
    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    /// Trim to `now - window`, append `now` and return the new length.
    ///
    /// The default composes the three list primitives and is therefore not
    /// atomic; backends override it with a single atomic step.
    async fn record_in_log(&self, key: &str, now: u64, window: Duration) -> StoreResult<u64> {
        let min = now.saturating_sub(window.as_nanos() as u64);
        self.trim_list(key, min).await?;
        self.add_to_list(key, now).await?;
        self.list_len(key).await
    }

    /// Refill the bucket at `key` for the time elapsed since its last refill,
    /// then try to take one token. One atomic read-modify-write.
    async fn take_token(&self, key: &str, rate: f64, burst: u64, now: u64) -> StoreResult<bool>;

    /// Append `now` to the queue at `key` if it holds fewer than `burst`
    /// entries. A full queue is left untouched.
    async fn enqueue(&self, key: &str, burst: u64, now: u64) -> StoreResult<bool>;

    /// Let at most one entry leak out of the queue at `key`.
    ///
    /// The head may leave once `1 / rate` seconds have passed since the later
    /// of its insertion and the previous leak.
    async fn dequeue(&self, key: &str, rate: f64, now: u64) -> StoreResult<()>;
}

/// Nanoseconds between two leaks at `rate` items per second.
pub(crate) fn leak_interval_nanos(rate: f64) -> u64 {
    (1_000_000_000.0 / rate).ceil() as u64
}

/// An opened store plus whatever background work it owns.
pub struct StoreHandle {
    store: Arc<dyn Store>,
    sweeper: Option<SweeperHandle>,
}

impl StoreHandle {
    /// The store shared by all limiters.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Stop background work owned by the store.
    pub async fn close(self) {
        if let Some(sweeper) = self.sweeper {
            sweeper.shutdown().await;
        }
    }
}

/// Open the store described by `config`.
///
/// An in-process store gets its eviction sweeper started here; it stops when
/// the handle is closed or dropped.
pub async fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<StoreHandle> {
    match config {
        StoreConfig::Memory {
            sweep_interval_secs,
            idle_cycles,
        } => {
            let store = Arc::new(MemoryStore::with_clock(
                MemoryStoreConfig {
                    sweep_interval: Duration::from_secs(*sweep_interval_secs),
                    idle_cycles: *idle_cycles,
                },
                clock,
            ));
            let sweeper = store.spawn_sweeper();
            Ok(StoreHandle {
                store,
                sweeper: Some(sweeper),
            })
        }
        StoreConfig::Redis {
            url,
            command_timeout_ms,
            idle_ttl_secs,
        } => {
            info!(url = %url, "Opening Redis store");
            let store = RedisStore::connect(RedisStoreConfig {
                url: url.clone(),
                command_timeout: Duration::from_millis(*command_timeout_ms),
                idle_ttl: Duration::from_secs(*idle_ttl_secs),
            })
            .await?;
            Ok(StoreHandle {
                store: Arc::new(store),
                sweeper: None,
            })
        }
    }
}
