//! In-process store.
//!
//! Per-key state lives in a sharded concurrent map, so every operation is a
//! single critical section on the key's shard and unrelated keys rarely
//! contend. Idle keys are removed by a sweeper task owned through a
//! [`SweeperHandle`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{leak_interval_nanos, Store, StoreResult};
use crate::clock::{Clock, SystemClock};

/// Default interval between eviction sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default number of sweep intervals a key may sit idle before eviction.
const DEFAULT_IDLE_CYCLES: u32 = 3;

/// Configuration for the in-process store.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Keys untouched for this many sweep intervals are evicted.
    pub idle_cycles: u32,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_cycles: DEFAULT_IDLE_CYCLES,
        }
    }
}

impl MemoryStoreConfig {
    fn idle_limit_nanos(&self) -> u64 {
        (self.sweep_interval * self.idle_cycles).as_nanos() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
    /// When the bucket is back at capacity; from then on it equals a fresh one.
    full_at: u64,
}

/// Everything a single key can hold. Keys are namespaced per algorithm, so
/// in practice only one of the fields is ever populated.
#[derive(Debug, Default)]
struct Entry {
    counter: Option<Counter>,
    log: Vec<u64>,
    /// Window of the last `record_in_log`; unknown for bare list appends.
    log_window: Option<u64>,
    bucket: Option<Bucket>,
    queue: VecDeque<u64>,
    last_leak: Option<u64>,
    /// Leak cadence seen by the last `dequeue`.
    leak_interval: Option<u64>,
    last_seen: u64,
}

impl Entry {
    /// The live counter, if it has not expired at `now`.
    fn live_counter(&self, now: u64) -> Option<Counter> {
        self.counter.filter(|c| now < c.expires_at)
    }

    /// The instant after which dropping this entry no longer changes any
    /// decision: counters have expired, logged requests have left their
    /// window, the bucket has refilled and the queue has drained.
    fn live_until(&self) -> u64 {
        let counter = self.counter.map_or(0, |c| c.expires_at);
        let log = match (self.log.iter().max(), self.log_window) {
            (Some(&last), Some(window)) => last.saturating_add(window),
            _ => 0,
        };
        let bucket = self.bucket.map_or(0, |b| b.full_at);
        let queue = match (self.queue.front(), self.leak_interval) {
            (Some(&head), Some(interval)) => {
                let base = self.last_leak.map_or(head, |last| last.max(head));
                base.saturating_add(interval.saturating_mul(self.queue.len() as u64))
            }
            _ => 0,
        };
        counter.max(log).max(bucket).max(queue)
    }
}

/// A [`Store`] that keeps all state in this process.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    config: MemoryStoreConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store on the system clock with default sweep settings.
    pub fn new() -> Self {
        Self::with_clock(MemoryStoreConfig::default(), Arc::new(SystemClock))
    }

    /// Create a store with explicit settings and time source.
    pub fn with_clock(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            config,
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lock the entry for `key`, creating it on first use, and mark it seen.
    fn touch(&self, key: &str) -> (RefMut<'_, String, Entry>, u64) {
        let now = self.clock.now_nanos();
        let mut entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => {
                trace!(key = %key, "Creating store entry");
                self.entries.entry(key.to_owned()).or_default()
            }
        };
        entry.last_seen = now;
        (entry, now)
    }

    /// Evict every key idle for longer than the configured number of sweep
    /// intervals whose state has also run out. Returns the number of
    /// evicted keys.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_nanos();
        let idle_limit = self.config.idle_limit_nanos();
        let mut evicted = 0;

        self.entries.retain(|_, entry| {
            let keep =
                now.saturating_sub(entry.last_seen) <= idle_limit || now <= entry.live_until();
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted idle keys");
        }
        evicted
    }

    /// Start the background sweeper on the current tokio runtime.
    ///
    /// The task holds only a weak reference, so it also ends once the store
    /// itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let interval = self.config.sweep_interval;
        let store: Weak<Self> = Arc::downgrade(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(interval = ?interval, idle_cycles = self.config.idle_cycles, "Starting key sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; nothing is idle yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.sweep();
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            debug!("Key sweeper stopped");
        });

        SweeperHandle {
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Some(task),
        }
    }
}

/// Owns the sweeper task. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ask the sweeper to stop without waiting for it.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Key sweeper shut down");
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let (mut entry, now) = self.touch(key);
        let counter = match entry.live_counter(now) {
            Some(c) => Counter {
                count: c.count + 1,
                expires_at: c.expires_at,
            },
            None => Counter {
                count: 1,
                expires_at: now.saturating_add(window.as_nanos() as u64),
            },
        };
        entry.counter = Some(counter);
        Ok(counter.count)
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now_nanos();
        Ok(self
            .entries
            .get(key)
            .and_then(|e| e.live_counter(now))
            .map_or(0, |c| c.count))
    }

    async fn get_with_ttl(&self, key: &str) -> StoreResult<(u64, Option<Duration>)> {
        let now = self.clock.now_nanos();
        let counter = self.entries.get(key).and_then(|e| e.live_counter(now));
        Ok(match counter {
            Some(c) => (c.count, Some(Duration::from_nanos(c.expires_at - now))),
            None => (0, None),
        })
    }

    async fn add_to_list(&self, key: &str, timestamp: u64) -> StoreResult<()> {
        let (mut entry, _) = self.touch(key);
        entry.log.push(timestamp);
        Ok(())
    }

    async fn trim_list(&self, key: &str, min_timestamp: u64) -> StoreResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.log.retain(|&ts| ts >= min_timestamp);
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        Ok(self.entries.get(key).map_or(0, |e| e.log.len() as u64))
    }

    async fn record_in_log(&self, key: &str, now: u64, window: Duration) -> StoreResult<u64> {
        let min = now.saturating_sub(window.as_nanos() as u64);
        let (mut entry, _) = self.touch(key);
        entry.log.retain(|&ts| ts >= min);
        entry.log.push(now);
        entry.log_window = Some(window.as_nanos() as u64);
        Ok(entry.log.len() as u64)
    }

    async fn take_token(&self, key: &str, rate: f64, burst: u64, now: u64) -> StoreResult<bool> {
        let (mut entry, _) = self.touch(key);
        let capacity = burst as f64;

        // A new bucket starts full.
        let mut bucket = entry.bucket.unwrap_or(Bucket {
            tokens: capacity,
            last_refill: now,
            full_at: now,
        });

        let elapsed_secs = now.saturating_sub(bucket.last_refill) as f64 / 1_000_000_000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * rate).min(capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        let granted = bucket.tokens >= 1.0;
        if granted {
            bucket.tokens -= 1.0;
        }
        let refill_nanos = ((capacity - bucket.tokens) / rate * 1_000_000_000.0).ceil();
        bucket.full_at = bucket.last_refill.saturating_add(refill_nanos as u64);
        entry.bucket = Some(bucket);
        Ok(granted)
    }

    async fn enqueue(&self, key: &str, burst: u64, now: u64) -> StoreResult<bool> {
        let (mut entry, _) = self.touch(key);
        if entry.queue.len() as u64 >= burst {
            return Ok(false);
        }
        entry.queue.push_back(now);
        Ok(true)
    }

    async fn dequeue(&self, key: &str, rate: f64, now: u64) -> StoreResult<()> {
        let (mut entry, _) = self.touch(key);
        let interval = leak_interval_nanos(rate);
        entry.leak_interval = Some(interval);
        let Some(&head) = entry.queue.front() else {
            return Ok(());
        };

        let base = entry.last_leak.map_or(head, |last| last.max(head));
        if now.saturating_sub(base) >= interval {
            entry.queue.pop_front();
            entry.last_leak = Some(base + interval);
        }
        Ok(())
    }
}
