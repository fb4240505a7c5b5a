//! Pool counters the client crates do not keep themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pylon_core::PoolStats;

#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A checkout reused an idle connection.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout had to open a new connection.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout found no idle connection and waited `waited`.
    pub fn waited(&self, waited: Duration) {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// `stats` with the counter fields filled in.
    pub fn apply(&self, stats: PoolStats) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
            ..stats
        }
    }
}
