//! Shared fixtures for algorithm tests.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, ManualClock};
use crate::store::{MemoryStore, MemoryStoreConfig};

/// An in-process store and the manual clock driving it, starting at
/// `start` past the epoch.
pub(crate) fn memory_store(start: Duration) -> (MemoryStore, ManualClock) {
    let clock = ManualClock::new(start);
    let store = MemoryStore::with_clock(MemoryStoreConfig::default(), Arc::new(clock.clone()));
    (store, clock)
}

/// Current reading of `clock`.
pub(crate) fn now(clock: &ManualClock) -> u64 {
    clock.now_nanos()
}
